//! Behavioural tests for layered harness configuration.

use std::cell::RefCell;
use std::ffi::OsString;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use vigil_config::{HarnessConfig, LogLevel, load_harness_config};

type StepResult = Result<(), String>;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const HARNESS_VARS: &[&str] = &[
    "VIGIL_BIN_DIR",
    "VIGIL_LOG_FILTER",
    "VIGIL_LOG_FORMAT",
    "VIGIL_VERBOSITY",
    "VIGIL_STARTUP_TIMEOUT_SECS",
    "VIGIL_STOP_TIMEOUT_SECS",
    "VIGIL_COLLECTOR_PORT",
    "VIGIL_LOG_PREFIX",
    "VIGIL_HELPER_WORKERS",
];

struct ConfigWorld {
    args: Vec<OsString>,
    overrides: Vec<(String, Option<OsString>)>,
    loaded: Option<Result<HarnessConfig, String>>,
    _guard: MutexGuard<'static, ()>,
}

impl ConfigWorld {
    fn new() -> Self {
        let guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        Self {
            args: vec![OsString::from("vigil")],
            overrides: Vec::new(),
            loaded: None,
            _guard: guard,
        }
    }

    fn set_env(&mut self, key: &str, value: Option<&str>) {
        let previous = std::env::var_os(key);
        // Environment mutation is `unsafe` on edition 2024; the world holds the
        // env mutex and restores every override in `Drop`.
        match value {
            Some(value) => unsafe { std::env::set_var(key, value) },
            None => unsafe { std::env::remove_var(key) },
        }
        self.overrides.push((key.to_owned(), previous));
    }

    fn load(&mut self) {
        if self.loaded.is_none() {
            let result = load_harness_config(self.args.clone()).map_err(|error| error.to_string());
            self.loaded = Some(result);
        }
    }

    fn config(&mut self) -> Result<&HarnessConfig, String> {
        self.load();
        match self.loaded.as_ref() {
            Some(Ok(config)) => Ok(config),
            Some(Err(error)) => Err(format!("configuration failed to load: {error}")),
            None => Err("configuration was not loaded".to_owned()),
        }
    }
}

impl Drop for ConfigWorld {
    fn drop(&mut self) {
        while let Some((key, value)) = self.overrides.pop() {
            match value {
                Some(value) => unsafe { std::env::set_var(&key, value) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}

#[fixture]
fn world() -> RefCell<ConfigWorld> {
    RefCell::new(ConfigWorld::new())
}

#[given("a clean harness environment")]
fn given_clean_environment(world: &RefCell<ConfigWorld>) {
    let mut world = world.borrow_mut();
    for key in HARNESS_VARS {
        world.set_env(key, None);
    }
}

#[given("the environment sets \"{key}\" to \"{value}\"")]
fn given_env(world: &RefCell<ConfigWorld>, key: String, value: String) {
    world.borrow_mut().set_env(&key, Some(&value));
}

#[when("the command line passes \"{flag}\" with \"{value}\"")]
fn when_cli_flag(world: &RefCell<ConfigWorld>, flag: String, value: String) {
    let mut world = world.borrow_mut();
    world.args.push(OsString::from(flag));
    world.args.push(OsString::from(value));
}

#[when("the configuration loads without overrides")]
fn when_load(world: &RefCell<ConfigWorld>) {
    world.borrow_mut().load();
}

#[then("the startup timeout is {seconds} seconds")]
fn then_startup_timeout(world: &RefCell<ConfigWorld>, seconds: u64) -> StepResult {
    let mut world = world.borrow_mut();
    let actual = world.config()?.startup_timeout();
    if actual == Duration::from_secs(seconds) {
        Ok(())
    } else {
        Err(format!("expected {seconds}s startup timeout, got {actual:?}"))
    }
}

#[then("the daemon log level is \"{level}\"")]
fn then_log_level(world: &RefCell<ConfigWorld>, level: String) -> StepResult {
    let expected: LogLevel = level
        .parse()
        .map_err(|error| format!("invalid level '{level}': {error}"))?;
    let mut world = world.borrow_mut();
    let actual = world.config()?.daemon_log_level();
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected level {expected}, got {actual}"))
    }
}

#[scenario(path = "tests/features/harness_configuration.feature")]
fn harness_configuration(#[from(world)] world: RefCell<ConfigWorld>) {
    let _ = world;
}

//! Behavioural tests for relaying worker records to the collector.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use vigil_relay::{
    LogCollector, LogRecord, LogRelay, MemorySink, RecordLevel, RecordQueue, RecordSink,
    RelayError, RelaySettings, RelayStats,
};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

type StepResult = Result<(), String>;

#[derive(Default)]
struct RelayWorld {
    sink: Option<Arc<MemorySink>>,
    collector: Option<LogCollector>,
    relay: Option<LogRelay>,
    queue: Option<RecordQueue>,
    stopped: Option<Result<RelayStats, RelayError>>,
}

impl RelayWorld {
    fn sink(&self) -> Result<&Arc<MemorySink>, String> {
        self.sink.as_ref().ok_or_else(|| "no collector configured".to_owned())
    }

    fn queue(&self) -> Result<&RecordQueue, String> {
        self.queue.as_ref().ok_or_else(|| "no relay configured".to_owned())
    }

    fn stats(&self) -> Result<RelayStats, String> {
        match self.stopped.as_ref() {
            Some(Ok(stats)) => Ok(*stats),
            Some(Err(error)) => Err(format!("relay failed to stop: {error}")),
            None => Err("relay was not shut down".to_owned()),
        }
    }
}

#[fixture]
fn world() -> RefCell<RelayWorld> {
    RefCell::new(RelayWorld::default())
}

#[given("a log collector keeping records in memory")]
fn given_collector(world: &RefCell<RelayWorld>) -> StepResult {
    let sink = Arc::new(MemorySink::new());
    let collector = LogCollector::bind("127.0.0.1", 0, Arc::clone(&sink) as Arc<dyn RecordSink>)
        .map_err(|error| error.to_string())?;
    let mut world = world.borrow_mut();
    world.sink = Some(sink);
    world.collector = Some(collector);
    Ok(())
}

#[given("a log relay connected with prefix \"{prefix}\"")]
fn given_relay(world: &RefCell<RelayWorld>, prefix: String) -> StepResult {
    let mut world = world.borrow_mut();
    let port = world
        .collector
        .as_ref()
        .map(LogCollector::port)
        .ok_or_else(|| "collector must exist before the relay".to_owned())?;
    let relay = LogRelay::start(&RelaySettings::new("127.0.0.1", port, prefix))
        .map_err(|error| error.to_string())?;
    world.queue = Some(relay.queue());
    world.relay = Some(relay);
    Ok(())
}

#[when("the relay receives records \"{first}\" and \"{second}\"")]
fn when_records(world: &RefCell<RelayWorld>, first: String, second: String) -> StepResult {
    let world = world.borrow();
    let queue = world.queue()?;
    for message in [first, second] {
        if !queue.push(LogRecord::new(RecordLevel::Info, "salt.minion", message)) {
            return Err("relay queue closed early".to_owned());
        }
    }
    Ok(())
}

#[when("the relay is shut down")]
fn when_shutdown(world: &RefCell<RelayWorld>) -> StepResult {
    let mut world = world.borrow_mut();
    let relay = world.relay.take().ok_or_else(|| "no relay running".to_owned())?;
    world.stopped = Some(relay.shutdown());
    Ok(())
}

#[when("a record \"{message}\" is pushed after shutdown")]
fn when_late_record(world: &RefCell<RelayWorld>, message: String) -> StepResult {
    let world = world.borrow();
    if world.queue()?.push(LogRecord::new(RecordLevel::Info, "salt.minion", message)) {
        Err("queue accepted a record after shutdown".to_owned())
    } else {
        Ok(())
    }
}

#[when("the collector stops")]
fn when_collector_stops(world: &RefCell<RelayWorld>) -> StepResult {
    let collector = world
        .borrow_mut()
        .collector
        .take()
        .ok_or_else(|| "no collector running".to_owned())?;
    collector.shutdown();
    Ok(())
}

#[then("the collector observes {count} records")]
fn then_count(world: &RefCell<RelayWorld>, count: usize) -> StepResult {
    let world = world.borrow();
    let sink = world.sink()?;
    if !sink.wait_for(count, DELIVERY_TIMEOUT) {
        return Err(format!("only {} records arrived", sink.records().len()));
    }
    let received = sink.records().len();
    if received == count {
        Ok(())
    } else {
        Err(format!("expected exactly {count} records, got {received}"))
    }
}

#[then("the collector messages are \"{first}\" then \"{second}\"")]
fn then_messages(world: &RefCell<RelayWorld>, first: String, second: String) -> StepResult {
    let world = world.borrow();
    let messages: Vec<String> = world
        .sink()?
        .records()
        .into_iter()
        .map(|record| record.message)
        .collect();
    if messages == [first.clone(), second.clone()] {
        Ok(())
    } else {
        Err(format!("expected [{first}, {second}], got {messages:?}"))
    }
}

#[then("the relay forwarded {count} records")]
fn then_forwarded(world: &RefCell<RelayWorld>, count: usize) -> StepResult {
    let stats = world.borrow().stats()?;
    if stats.forwarded == count && !stats.disconnected {
        Ok(())
    } else {
        Err(format!("unexpected relay stats: {stats:?}"))
    }
}

#[then("the relay shut down without error")]
fn then_clean_shutdown(world: &RefCell<RelayWorld>) -> StepResult {
    world.borrow().stats().map(|_| ())
}

#[scenario(path = "tests/features/log_relay.feature")]
fn log_relay(#[from(world)] world: RefCell<RelayWorld>) {
    let _ = world;
}

mod common;

use std::{
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use common::{ask, eventually, running, MemStore};
use nodeview::{
    completion, ErrorKind, Executor, ExecutorConfig, ExecutorState, Network, ShutdownReason,
};

fn executor(store: &Arc<MemStore>) -> anyhow::Result<Executor> {
    let config = ExecutorConfig::for_directory("unused", Network::Regtest);
    Ok(Executor::with_store(config, store.clone())?)
}

#[test]
fn transitions_are_checked_and_counted() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = executor(&store)?;
    assert_eq!(executor.state(), ExecutorState::Constructed);
    assert_eq!(executor.transitions(), 0);

    assert_eq!(executor.stop().unwrap_err().kind(), ErrorKind::InvalidState);

    executor.init_chain()?;
    assert_eq!(executor.state(), ExecutorState::Initialized);
    assert_eq!(executor.init_chain().unwrap_err().kind(), ErrorKind::InvalidState);

    executor.run()?;
    assert_eq!(executor.state(), ExecutorState::Running);
    assert_eq!(executor.run().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(executor.transitions(), 2);

    executor.stop()?;
    executor.stop()?;
    assert_eq!(executor.state(), ExecutorState::Stopped);
    assert_eq!(executor.transitions(), 3);

    assert_eq!(executor.run().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(executor.init_chain().unwrap_err().kind(), ErrorKind::InvalidState);
    Ok(())
}

#[test]
fn calls_fail_unless_running() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = executor(&store)?;
    let chain = executor.chain();
    assert!(!chain.is_running());

    let err = ask(|h| chain.fetch_last_height(h)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineNotRunning);

    executor.init_chain()?;
    executor.run()?;
    assert!(chain.is_running());
    assert_eq!(ask(|h| chain.fetch_last_height(h))?, 0);

    executor.stop()?;
    assert!(!chain.is_running());
    let err = ask(|h| chain.fetch_block_by_height(0, h)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineNotRunning);
    assert_eq!(chain.pending_requests(), 0);
    Ok(())
}

#[test]
fn refusals_never_run_on_the_calling_thread() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = executor(&store)?;
    let chain = executor.chain();

    // The caller holds a lock its handler needs; inline delivery would
    // deadlock the calling thread.
    let shared = Arc::new(Mutex::new(()));
    let (tx, rx) = mpsc::channel();
    let caller = {
        let shared = shared.clone();
        thread::spawn(move || {
            let _held = shared.lock().unwrap();
            let inner = shared.clone();
            chain.fetch_last_height(move |result| {
                drop(inner.lock().unwrap());
                let _ = tx.send((thread::current().id(), result.map_err(|e| e.kind())));
            });
            thread::current().id()
        })
    };
    let (handler_thread, result) = rx.recv_timeout(Duration::from_secs(10))?;
    let caller = caller.join().unwrap();
    assert_ne!(handler_thread, caller);
    assert_eq!(result, Err(ErrorKind::EngineNotRunning));
    assert_eq!(executor.chain().pending_requests(), 0);
    Ok(())
}

#[test]
fn stop_answers_on_engine_threads() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = running(&store)?;
    let chain = executor.chain();
    store.set_tip_delay(Duration::from_millis(500));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (request_sink, sub_sink) = (seen.clone(), seen.clone());
    chain.fetch_last_height(move |result| {
        request_sink
            .lock()
            .unwrap()
            .push((thread::current().id(), result.map(drop).map_err(|e| e.kind())));
    });
    let _sub = chain.subscribe_reorganize(move |event| {
        sub_sink
            .lock()
            .unwrap()
            .push((thread::current().id(), event.map(drop).map_err(|e| e.kind())));
        true
    });

    executor.stop()?;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2, "stop returned before its terminal deliveries");
    for (thread_id, result) in seen.iter() {
        assert_ne!(*thread_id, thread::current().id());
        assert_eq!(*result, Err(ErrorKind::EngineNotRunning));
    }
    Ok(())
}

#[test]
fn running_without_init_serves_an_empty_chain() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = executor(&store)?;
    executor.run()?;
    let err = ask(|h| executor.chain().fetch_last_height(h)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn second_owner_sees_store_locked() -> anyhow::Result<()> {
    let store = MemStore::new();
    let first = running(&store)?;

    let second = executor(&store)?;
    assert_eq!(second.run().unwrap_err().kind(), ErrorKind::StoreLocked);
    assert_eq!(second.state(), ExecutorState::Constructed);

    first.stop()?;
    second.run()?;
    assert_eq!(second.state(), ExecutorState::Running);
    Ok(())
}

#[test]
fn stop_aborts_parked_requests() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = running(&store)?;
    let chain = executor.chain();
    store.set_tip_delay(Duration::from_millis(500));

    let (handler, mut pending) = completion::channel();
    chain.fetch_last_height(handler);
    assert_eq!(chain.pending_requests(), 1);

    executor.stop()?;
    let answer = pending.wait_timeout(Duration::from_secs(1));
    assert_eq!(
        answer.map(|r| r.map_err(|e| e.kind())),
        Some(Err(ErrorKind::EngineNotRunning))
    );
    assert_eq!(chain.pending_requests(), 0);
    Ok(())
}

#[test]
fn dropping_a_running_executor_stops_it() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = running(&store)?;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = executor.chain().subscribe_reorganize(move |event| {
        sink.lock().unwrap().push(event.map(drop).map_err(|e| e.kind()));
        true
    });

    drop(executor);
    assert_eq!(*events.lock().unwrap(), vec![Err(ErrorKind::EngineNotRunning)]);

    // The store was released.
    let again = running(&store)?;
    assert_eq!(again.state(), ExecutorState::Running);
    Ok(())
}

#[test]
fn run_wait_returns_on_request() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = executor(&store)?;
    executor.init_chain()?;
    let handle = executor.shutdown_handle();

    let requester = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.request();
    });
    assert_eq!(executor.run_wait()?, ShutdownReason::Requested);
    assert_eq!(executor.state(), ExecutorState::Stopped);
    requester.join().unwrap();
    Ok(())
}

#[test]
fn run_wait_returns_when_stopped_elsewhere() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = executor(&store)?;

    thread::scope(|s| -> anyhow::Result<()> {
        let waiter = s.spawn(|| executor.run_wait());
        assert!(eventually(|| executor.state() == ExecutorState::Running));
        executor.stop()?;
        assert_eq!(waiter.join().unwrap()?, ShutdownReason::Requested);
        Ok(())
    })?;
    assert_eq!(executor.transitions(), 2);
    Ok(())
}

#[tokio::test]
async fn usable_from_async_code() -> anyhow::Result<()> {
    let store = MemStore::new();
    let executor = running(&store)?;
    let chain = executor.chain();

    let (handler, pending) = completion::channel();
    chain.fetch_last_height(handler);
    assert_eq!(pending.await?, 0);

    let (handler, pending) = completion::channel::<u32>();
    let mut handler = Some(handler);
    let _sub = chain.subscribe_transaction(move |event| {
        if let Some(handler) = handler.take() {
            handler(event.map(|_| 0));
        }
        false
    });
    drop(executor);
    assert!(!chain.is_running());
    assert_eq!(pending.await.unwrap_err().kind(), ErrorKind::EngineNotRunning);

    let again = running(&store)?;
    again.stop()?;
    assert_eq!(again.state(), ExecutorState::Stopped);
    Ok(())
}

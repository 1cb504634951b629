//! Engine-backed session integration tests.
//!
//! `TaskEngine` is a pass-through engine whose handshake consists of one
//! delegated task; the TLS tests run real rustls handshakes over loopback.


use enginet::prelude::*;
use session_helpers::*;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};

// ============================================================================
// Pass-through Engine
// ============================================================================

struct TaskEngine {
    started: bool,
    task_handed_out: bool,
    task_done: Arc<AtomicBool>,
    task_threads: Sender<ThreadId>,
    panic_in_task: bool,
    inbound_done: bool,
    outbound_closed: bool,
}

impl TaskEngine {
    fn new(task_threads: Sender<ThreadId>) -> Self {
        Self {
            started: false,
            task_handed_out: false,
            task_done: Arc::new(AtomicBool::new(false)),
            task_threads,
            panic_in_task: false,
            inbound_done: false,
            outbound_closed: false,
        }
    }

    fn panicking(mut self) -> Self {
        self.panic_in_task = true;
        self
    }
}

fn copy(sources: &[&[u8]], dst: &mut [u8]) -> usize {
    let mut copied = 0;
    for source in sources {
        let count = source.len().min(dst.len() - copied);
        dst[copied..copied + count].copy_from_slice(&source[..count]);
        copied += count;
        if copied == dst.len() {
            break;
        }
    }
    copied
}

impl Engine for TaskEngine {
    fn begin_handshake(&mut self) -> Result<(), Error> {
        self.started = true;
        Ok(())
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        if self.started && !self.task_done.load(Ordering::SeqCst) {
            HandshakeStatus::NeedTask
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if !self.started || self.task_handed_out {
            return None;
        }
        self.task_handed_out = true;
        let done = self.task_done.clone();
        let threads = self.task_threads.clone();
        let panic_in_task = self.panic_in_task;
        Some(DelegatedTask::new(move || {
            let _ = threads.send(thread::current().id());
            if panic_in_task {
                panic!("key exchange failed");
            }
            done.store(true, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn wrap(&mut self, sources: &[&[u8]], dst: &mut [u8]) -> Result<EngineResult, Error> {
        let status = self.handshake_status();
        if self.outbound_closed {
            return Ok(EngineResult::new(EngineStatus::Closed, status, 0, 0));
        }
        let count = copy(sources, dst);
        Ok(EngineResult::new(EngineStatus::Ok, status, count, count))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
        let status = self.handshake_status();
        let count = copy(&[src], dst);
        Ok(EngineResult::new(EngineStatus::Ok, status, count, count))
    }

    fn close_inbound(&mut self) -> Result<(), Error> {
        self.inbound_done = true;
        Ok(())
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed
    }

    fn min_application_buffer_size(&self) -> usize {
        1024
    }

    fn max_application_buffer_size(&self) -> usize {
        65536
    }

    fn min_network_buffer_size(&self) -> usize {
        1024
    }

    fn max_network_buffer_size(&self) -> usize {
        65536
    }
}

/// Engine stuck in its handshake, waiting for a peer message that never
/// comes. Closing its outbound side produces a one-byte close record.
#[derive(Default)]
struct WaitingEngine {
    started: bool,
    close_pending: bool,
    outbound_done: bool,
}

impl Engine for WaitingEngine {
    fn begin_handshake(&mut self) -> Result<(), Error> {
        self.started = true;
        Ok(())
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        if self.close_pending {
            HandshakeStatus::NeedWrap
        } else if self.started {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn wrap(&mut self, _sources: &[&[u8]], dst: &mut [u8]) -> Result<EngineResult, Error> {
        if self.close_pending {
            self.close_pending = false;
            self.outbound_done = true;
            dst[0] = 0x15;
            return Ok(EngineResult::new(EngineStatus::Closed, self.handshake_status(), 0, 1));
        }
        let status = if self.outbound_done {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, self.handshake_status(), 0, 0))
    }

    fn unwrap(&mut self, src: &[u8], _dst: &mut [u8]) -> Result<EngineResult, Error> {
        Ok(EngineResult::new(EngineStatus::Ok, self.handshake_status(), src.len(), 0))
    }

    fn close_inbound(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close_outbound(&mut self) {
        if !self.outbound_done {
            self.close_pending = true;
        }
    }

    fn is_inbound_done(&self) -> bool {
        false
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn min_application_buffer_size(&self) -> usize {
        1024
    }

    fn max_application_buffer_size(&self) -> usize {
        1024
    }

    fn min_network_buffer_size(&self) -> usize {
        1024
    }

    fn max_network_buffer_size(&self) -> usize {
        1024
    }
}

#[derive(Debug)]
struct RefusingExecutor;

impl TaskExecutor for RefusingExecutor {
    fn execute(&self, _task: enginet::reactor::Task) -> Result<(), Error> {
        Err(Error::Io(std::io::Error::other("no threads left")))
    }
}

fn exception_containing(observed: &[Observed], text: &str) -> bool {
    observed.iter().any(|observed| {
        matches!(observed, Observed::Exception(message) if message.contains(text))
    })
}

fn task_engine_pair(
    handle: &LoopHandle,
) -> (Session, Receiver<Observed>, Receiver<ThreadId>) {
    let (threads_tx, threads_rx) = channel();
    let server_threads = threads_tx.clone();
    let addr = handle
        .listen(
            localhost(),
            move |_peer: SocketAddr| -> Result<SessionSpec, Error> {
                let (echo, _observed) = Recorder::new(true);
                Ok(SessionSpec::new(echo).with_engine(TaskEngine::new(server_threads.clone())))
            },
        )
        .unwrap();

    let (recorder, rx) = Recorder::new(false);
    let (client, registered) = handle
        .connect(
            addr,
            SessionSpec::new(recorder).with_engine(TaskEngine::new(threads_tx)),
        )
        .unwrap();
    registered.wait().unwrap();
    (client, rx, threads_rx)
}

fn loop_thread(observed: &[Observed]) -> ThreadId {
    observed
        .iter()
        .find_map(|observed| match observed {
            Observed::Event(SessionEvent::Ready, thread) => Some(*thread),
            _ => None,
        })
        .expect("No READY event")
}

#[test]
fn delegated_task_runs_on_executor_thread() {
    let handle = start_loop("delegate");
    let (client, rx, task_threads) = task_engine_pair(&handle);

    let seen = wait_for_event(&rx, SessionEvent::Ready);
    assert_eq!(
        events(&seen),
        vec![
            SessionEvent::Created,
            SessionEvent::Opened,
            SessionEvent::Ready,
        ]
    );
    let loop_id = loop_thread(&seen);
    let task_id = task_threads.recv_timeout(TIMEOUT).unwrap();
    assert_ne!(task_id, loop_id);
    assert!(client.is_engine_backed());

    client.write(b"through the engine").wait().unwrap();
    assert_eq!(read_exactly(&rx, 18), b"through the engine");

    client.close();
    wait_for_event(&rx, SessionEvent::Ending);

    handle.stop(StopKind::Gentle);
    handle.join().unwrap();
}

#[test]
fn inline_executor_runs_tasks_on_loop_thread() {
    init_tracing();
    let handle = SelectorLoop::new("inline", LoopConfig::default())
        .unwrap()
        .with_executor(InlineExecutor)
        .start()
        .unwrap();
    let (client, rx, task_threads) = task_engine_pair(&handle);

    let seen = wait_for_event(&rx, SessionEvent::Ready);
    let task_id = task_threads.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(task_id, loop_thread(&seen));

    client.quick_close();
    wait_for_event(&rx, SessionEvent::Ending);

    handle.stop(StopKind::Gentle);
    handle.join().unwrap();
}

#[test]
fn plain_session_rejects_handshake() {
    let handle = start_loop("plain-handshake");
    let (recorder, _rx) = Recorder::new(false);
    let (session, registered) = handle.bind(localhost(), SessionSpec::new(recorder)).unwrap();
    registered.wait().unwrap();

    assert!(!session.is_engine_backed());
    assert!(matches!(
        session.begin_handshake(),
        Err(Error::Unsupported { kind: "plain" })
    ));

    handle.stop(StopKind::Quick);
    handle.join().unwrap();
}

#[test]
fn panicking_task_fires_exception() {
    let handle = start_loop("task-panic");
    let listener = std::net::TcpListener::bind(localhost()).unwrap();
    let (threads_tx, _threads_rx) = channel();

    let (recorder, rx) = Recorder::new(false);
    let (_client, registered) = handle
        .connect(
            listener.local_addr().unwrap(),
            SessionSpec::new(recorder).with_engine(TaskEngine::new(threads_tx).panicking()),
        )
        .unwrap();
    registered.wait().unwrap();

    let seen = wait_for_event(&rx, SessionEvent::Ending);
    assert!(!events(&seen).contains(&SessionEvent::Ready));
    assert!(exception_containing(&seen, "key exchange failed"));

    handle.stop(StopKind::Gentle);
    handle.join().unwrap();
}

#[test]
fn refused_task_fires_exception() {
    init_tracing();
    let handle = SelectorLoop::new("task-refused", LoopConfig::default())
        .unwrap()
        .with_executor(RefusingExecutor)
        .start()
        .unwrap();
    let listener = std::net::TcpListener::bind(localhost()).unwrap();
    let (threads_tx, threads_rx) = channel();

    let (recorder, rx) = Recorder::new(false);
    let (_client, registered) = handle
        .connect(
            listener.local_addr().unwrap(),
            SessionSpec::new(recorder).with_engine(TaskEngine::new(threads_tx)),
        )
        .unwrap();
    registered.wait().unwrap();

    let seen = wait_for_event(&rx, SessionEvent::Ending);
    assert!(!events(&seen).contains(&SessionEvent::Ready));
    assert!(exception_containing(&seen, "no threads left"));
    assert!(threads_rx.try_recv().is_err());

    handle.stop(StopKind::Gentle);
    handle.join().unwrap();
}

#[test]
fn quick_close_during_handshake_ends_session() {
    let handle = start_loop("handshake-close");
    let listener = std::net::TcpListener::bind(localhost()).unwrap();

    let config = SessionConfig {
        wait_for_inbound_close: true,
        ..SessionConfig::default()
    };
    let (recorder, rx) = Recorder::new(false);
    let (client, registered) = handle
        .connect(
            listener.local_addr().unwrap(),
            SessionSpec::new(recorder)
                .with_config(config)
                .with_engine(WaitingEngine::default()),
        )
        .unwrap();
    registered.wait().unwrap();
    let (mut silent, _) = listener.accept().unwrap();
    wait_for_event(&rx, SessionEvent::Opened);

    client.quick_close();
    let seen = wait_for_event(&rx, SessionEvent::Ending);
    assert!(!events(&seen).contains(&SessionEvent::Ready));
    assert!(!seen
        .iter()
        .any(|observed| matches!(observed, Observed::Exception(_))));

    // The close record went out before the channel closed.
    let mut received = Vec::new();
    silent
        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
        .unwrap();
    silent.read_to_end(&mut received).unwrap();
    assert_eq!(received, vec![0x15]);

    handle.stop(StopKind::Gentle);
    handle.join().unwrap();
}

#[test]
fn broken_channel_ends_session_waiting_for_close_message() {
    let handle = start_loop("broken-channel");
    let listener = std::net::TcpListener::bind(localhost()).unwrap();
    let (threads_tx, _threads_rx) = channel();

    let config = SessionConfig {
        wait_for_inbound_close: true,
        ..SessionConfig::default()
    };
    let (recorder, rx) = Recorder::new(false);
    let (client, registered) = handle
        .connect(
            listener.local_addr().unwrap(),
            SessionSpec::new(recorder)
                .with_config(config)
                .with_engine(TaskEngine::new(threads_tx)),
        )
        .unwrap();
    registered.wait().unwrap();
    let (peer, _) = listener.accept().unwrap();
    wait_for_event(&rx, SessionEvent::Ready);

    client.suspend_read();
    drop(peer);
    for _ in 0..500 {
        if client.write(b"into the void").wait().is_err() {
            break;
        }
        thread::sleep(std::time::Duration::from_millis(10));
    }

    let seen = wait_for_event(&rx, SessionEvent::Ending);
    assert!(seen
        .iter()
        .any(|observed| matches!(observed, Observed::Exception(message) if message.contains("I/O error"))));
    assert_eq!(client.closing_state(), ClosingState::Finished);

    handle.stop(StopKind::Gentle);
    handle.join().unwrap();
}

// ============================================================================
// TLS
// ============================================================================

#[cfg(feature = "tls")]
mod tls {
    use super::tls_test_helper::generate_test_tls_config_separate;
    use super::*;
    use std::time::Duration;

    fn tls_server(handle: &LoopHandle, factory: TlsEngineFactory) -> (SocketAddr, Receiver<Receiver<Observed>>) {
        let (tx, rx) = channel();
        let addr = handle
            .listen(
                localhost(),
                move |_peer: SocketAddr| -> Result<SessionSpec, Error> {
                    let (echo, observed) = Recorder::new(true);
                    let _ = tx.send(observed);
                    Ok(SessionSpec::new(echo)
                        .with_name("tls-server")
                        .with_engine(factory.server_engine()?))
                },
            )
            .unwrap();
        (addr, rx)
    }

    #[test]
    fn tls_echo_and_close() {
        let (config, _guard) = generate_test_tls_config_separate();
        let factory = TlsEngineFactory::new(&config).unwrap();
        let handle = start_loop("tls");
        let (addr, servers) = tls_server(&handle, factory.clone());

        let (recorder, rx) = Recorder::new(false);
        let (client, registered) = handle
            .connect(
                addr,
                SessionSpec::new(recorder)
                    .with_name("tls-client")
                    .with_engine(factory.client_engine().unwrap()),
            )
            .unwrap();
        registered.wait().unwrap();
        let mut seen = wait_for_event(&rx, SessionEvent::Ready);

        let message = b"hello over tls";
        client.write(message).wait().unwrap();
        assert_eq!(read_exactly(&rx, message.len()), message);

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client.write_no_future(&payload).unwrap();
        assert_eq!(read_exactly(&rx, payload.len()), payload);

        client.close();
        seen.extend(wait_for_event(&rx, SessionEvent::Ending));
        assert_eq!(
            events(&seen),
            vec![
                SessionEvent::Created,
                SessionEvent::Opened,
                SessionEvent::Ready,
                SessionEvent::Closed,
                SessionEvent::Ending,
            ]
        );
        assert!(!seen
            .iter()
            .any(|observed| matches!(observed, Observed::Exception(_))));

        let server_rx = servers.recv_timeout(TIMEOUT).unwrap();
        let server_seen = wait_for_event(&server_rx, SessionEvent::Ending);
        assert!(events(&server_seen).contains(&SessionEvent::Ready));

        handle.stop(StopKind::Gentle);
        handle.join().unwrap();
    }

    #[test]
    fn tls_handshake_timeout_against_silent_peer() {
        let (config, _guard) = generate_test_tls_config_separate();
        let factory = TlsEngineFactory::new(&config).unwrap();
        let handle = start_loop("tls-timeout");

        // Accepts the connection but never answers the client hello.
        let listener = std::net::TcpListener::bind(localhost()).unwrap();
        let addr = listener.local_addr().unwrap();

        let session_config = SessionConfig {
            handshake_timeout: Some(Duration::from_millis(100)),
            ..SessionConfig::default()
        };
        let (recorder, rx) = Recorder::new(false);
        let (_client, registered) = handle
            .connect(
                addr,
                SessionSpec::new(recorder)
                    .with_config(session_config)
                    .with_engine(factory.client_engine().unwrap()),
            )
            .unwrap();
        registered.wait().unwrap();
        let (_silent, _) = listener.accept().unwrap();

        let seen = wait_for_event(&rx, SessionEvent::Ending);
        assert!(!events(&seen).contains(&SessionEvent::Ready));
        assert!(seen.iter().any(|observed| matches!(
            observed,
            Observed::Exception(message) if message.contains("timed out")
        )));

        handle.stop(StopKind::Gentle);
        handle.join().unwrap();
    }

    #[test]
    fn missing_tls_settings_are_reported() {
        let config = config::Config::builder().build().unwrap();
        let factory = TlsEngineFactory::new(&config).unwrap();
        assert!(matches!(
            factory.server_engine(),
            Err(Error::TlsServerConfigMissing)
        ));
        assert!(matches!(
            factory.client_engine(),
            Err(Error::TlsClientConfigMissing)
        ));
    }
}

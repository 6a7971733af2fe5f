use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::connection::handle_connection;
use crate::results::TaskResult;
use crate::state::AppState;
use crate::worker::spawn_workers;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub workers: usize,
    pub max_connections: Option<usize>,
    pub shutdown_grace: Duration,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
    options: ServerOptions,
}

impl Server {
    /// Failing to bind is the one fatal startup error.
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<AppState>,
        options: ServerOptions,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            options,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `shutdown` fires, then waits up to the grace period for
    /// open connections and workers before giving up on them.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        spawn_workers(self.options.workers, &self.state, &shutdown, &tracker);
        let limiter = self
            .options
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n)));

        if let Ok(addr) = self.local_addr() {
            info!("Listening on {}", addr);
        }
        loop {
            let permit = match &limiter {
                Some(limiter) => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break, // closed, never happens
                    },
                },
                None => None,
            };

            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            info!("Connection from {}", peer_addr);
            let state = self.state.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                let _permit = permit; // held for the connection's lifetime
                match handle_connection(stream, state, shutdown).await {
                    Ok(()) => info!("Connection from {} closed", peer_addr),
                    Err(e) => error!("Connection error from {}: {}", peer_addr, e),
                }
            });
        }

        info!("No longer accepting connections");
        let abandoned = self.state.queue.close().await;
        if !abandoned.is_empty() {
            warn!("dropping {} queued task(s)", abandoned.len());
        }
        for task in abandoned {
            task.audio.cleanup();
            self.state
                .results
                .put(&task.task_id, TaskResult::Failed("server shutting down".into()));
        }
        tracker.close();
        if tokio::time::timeout(self.options.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} task(s) still busy after {:?}, abandoning them",
                tracker.len(),
                self.options.shutdown_grace
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockLoader;
    use shared_protocol::{
        Client, ClientError, DEFAULT_MAX_FRAME_LEN, ServerMessage, TaskStatus,
        TranscribeOptions, encode_frame, read_frame,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct Running {
        addr: SocketAddr,
        state: Arc<AppState>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start(loader: MockLoader, workers: usize, max_frame_len: u64) -> Running {
        let options = ServerOptions {
            workers,
            max_connections: None,
            shutdown_grace: Duration::from_secs(2),
        };
        start_with(loader, max_frame_len, options).await
    }

    async fn start_with(
        loader: MockLoader,
        max_frame_len: u64,
        options: ServerOptions,
    ) -> Running {
        let state = AppState::new(Arc::new(loader), max_frame_len);
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), state.clone(), options)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        Running {
            addr,
            state,
            shutdown,
            handle,
        }
    }

    fn audio_file(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        path.to_str().unwrap().to_string()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn async_round_trip_delivers_result_once() {
        let loader = MockLoader::with_delays(Duration::ZERO, Duration::from_millis(300));
        let server = start(loader, 1, DEFAULT_MAX_FRAME_LEN).await;
        let dir = tempfile::tempdir().unwrap();
        let path = audio_file(&dir, "a.wav");

        let mut client = Client::connect(server.addr).await.unwrap();
        let options = TranscribeOptions {
            is_async: true,
            ..TranscribeOptions::default()
        };
        let task_id = match client.transcribe_path(&path, options).await.unwrap() {
            ServerMessage::Status(TaskStatus::Accepted { task_id }) => task_id,
            other => panic!("unexpected {other:?}"),
        };

        // the engine sleeps 300ms, so the first poll sees pending
        assert_eq!(client.get_result(&task_id).await.unwrap(), TaskStatus::Pending);

        let mut completed = None;
        for _ in 0..100 {
            match client.get_result(&task_id).await.unwrap() {
                TaskStatus::Pending => tokio::time::sleep(Duration::from_millis(20)).await,
                status => {
                    completed = Some(status);
                    break;
                }
            }
        }
        match completed {
            Some(TaskStatus::Completed { result }) => {
                assert_eq!(result.text, "base transcribe a.wav")
            }
            other => panic!("unexpected {other:?}"),
        }
        // consumed: a second poll is back to pending
        assert_eq!(client.get_result(&task_id).await.unwrap(), TaskStatus::Pending);
        assert_eq!(client.queue_status().await.unwrap(), (0, 0));

        server.shutdown.cancel();
        server.handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_async_task_is_reported() {
        let server = start(MockLoader::default(), 2, DEFAULT_MAX_FRAME_LEN).await;
        let dir = tempfile::tempdir().unwrap();
        let path = audio_file(&dir, "broken.wav");

        let mut client = Client::connect(server.addr).await.unwrap();
        let options = TranscribeOptions {
            is_async: true,
            ..TranscribeOptions::default()
        };
        let ServerMessage::Status(TaskStatus::Accepted { task_id }) =
            client.transcribe_path(&path, options).await.unwrap()
        else {
            panic!("not accepted");
        };

        let mut status = TaskStatus::Pending;
        for _ in 0..100 {
            status = client.get_result(&task_id).await.unwrap();
            if status != TaskStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            status,
            TaskStatus::Failed {
                error: "cannot decode broken.wav".into()
            }
        );
        server.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sync_path_and_errors_share_a_connection() {
        let server = start(MockLoader::default(), 1, DEFAULT_MAX_FRAME_LEN).await;
        let dir = tempfile::tempdir().unwrap();
        let path = audio_file(&dir, "hello.wav");

        let mut client = Client::connect(server.addr).await.unwrap();
        let err = client
            .request(&shared_protocol::ClientMessage::Transcribe {
                audio_data: None,
                audio_path: None,
                model: None,
                language: None,
                task: Default::default(),
                is_async: false,
            })
            .await
            .unwrap();
        assert_eq!(err, ServerMessage::error("path not specified"));

        let reply = client.send_raw(br#"{"command":"frobnicate"}"#).await.unwrap();
        assert_eq!(reply, ServerMessage::error("unknown command: frobnicate"));

        // malformed JSON does not close the connection
        let reply = client.send_raw(b"{{{").await.unwrap();
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let options = TranscribeOptions {
            model: Some("tiny".into()),
            ..TranscribeOptions::default()
        };
        match client.transcribe_path(&path, options).await.unwrap() {
            ServerMessage::Transcription(t) => assert_eq!(t.text, "tiny transcribe hello.wav"),
            other => panic!("unexpected {other:?}"),
        }
        match client.transcribe_data(b"RIFF", TranscribeOptions::default()).await.unwrap() {
            ServerMessage::Transcription(t) => assert_eq!(t.text, "base transcribe audio.bin"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.state.models.loaded(), vec!["base".to_string(), "tiny".to_string()]);

        let err = client
            .transcribe_path("/definitely/missing.wav", TranscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Server(msg) if msg.starts_with("file not found")));
        server.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pipelined_requests_are_answered_in_order() {
        let server = start(MockLoader::default(), 1, DEFAULT_MAX_FRAME_LEN).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        let mut wire = Vec::new();
        wire.extend(encode_frame(br#"{"command":"queue_status"}"#));
        wire.extend(encode_frame(br#"{"command":"nope"}"#));
        wire.extend(encode_frame(br#"{"command":"list_models"}"#));
        // dribble the bytes out to exercise partial reads
        for chunk in wire.chunks(5) {
            stream.write_all(chunk).await.unwrap();
            stream.flush().await.unwrap();
        }

        let mut replies = Vec::new();
        for _ in 0..3 {
            let frame = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap()
                .unwrap();
            replies.push(serde_json::from_slice::<ServerMessage>(&frame).unwrap());
        }
        assert!(matches!(replies[0], ServerMessage::QueueStatus { .. }));
        assert_eq!(replies[1], ServerMessage::error("unknown command: nope"));
        assert!(matches!(replies[2], ServerMessage::Models { .. }));
        server.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connections_do_not_cross_talk() {
        let server = start(MockLoader::default(), 1, DEFAULT_MAX_FRAME_LEN).await;
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<String> = (0..8)
            .map(|i| audio_file(&dir, &format!("clip{i}.wav")))
            .collect();

        let clients: Vec<_> = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let addr = server.addr;
                tokio::spawn(async move {
                    let mut client = Client::connect(addr).await.unwrap();
                    for _ in 0..5 {
                        assert!(matches!(
                            client.list_models().await.unwrap(),
                            ServerMessage::Models { .. }
                        ));
                        match client
                            .transcribe_path(&path, TranscribeOptions::default())
                            .await
                            .unwrap()
                        {
                            ServerMessage::Transcription(t) => {
                                assert_eq!(t.text, format!("base transcribe clip{i}.wav"))
                            }
                            other => panic!("unexpected {other:?}"),
                        }
                    }
                })
            })
            .collect();
        for c in clients {
            c.await.unwrap();
        }
        server.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_frame_closes_the_connection() {
        let server = start(MockLoader::default(), 1, 64).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        // the header alone is enough to be refused
        stream.write_all(&65u64.to_be_bytes()).await.unwrap();

        let frame = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        let reply: ServerMessage = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(reply, ServerMessage::Error { error } if error.contains("exceeds")));
        assert!(read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap().is_none());
        server.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_before_an_oversized_frame_are_answered() {
        let server = start(MockLoader::default(), 1, 64).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut wire = encode_frame(br#"{"command":"queue_status"}"#);
        wire.extend_from_slice(&65u64.to_be_bytes());
        stream.write_all(&wire).await.unwrap();

        let mut replies = Vec::new();
        while let Some(frame) = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap() {
            replies.push(serde_json::from_slice::<ServerMessage>(&frame).unwrap());
        }
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[0],
            ServerMessage::QueueStatus {
                queue_size: 0,
                stored_results: 0
            }
        );
        assert!(matches!(&replies[1], ServerMessage::Error { error } if error.contains("exceeds")));
        server.shutdown.cancel();
    }

    fn capped(max_connections: usize) -> ServerOptions {
        ServerOptions {
            workers: 1,
            max_connections: Some(max_connections),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connection_cap_holds_extra_clients_until_a_slot_frees() {
        let server = start_with(MockLoader::default(), DEFAULT_MAX_FRAME_LEN, capped(1)).await;

        let mut first = Client::connect(server.addr).await.unwrap();
        assert_eq!(first.queue_status().await.unwrap(), (0, 0));

        // the kernel completes the handshake, but nobody serves it yet
        let mut second = Client::connect(server.addr).await.unwrap();
        let waiting = tokio::spawn(async move { second.queue_status().await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!waiting.is_finished());

        drop(first);
        let served = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(served.unwrap(), (0, 0));
        server.shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_at_the_connection_cap_still_exits() {
        let server = start_with(MockLoader::default(), DEFAULT_MAX_FRAME_LEN, capped(1)).await;
        let mut held = Client::connect(server.addr).await.unwrap();
        held.queue_status().await.unwrap();
        let _queued = TcpStream::connect(server.addr).await.unwrap();

        server.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(held.queue_status().await, Err(ClientError::Closed | ClientError::Io(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_tasks_fail_on_shutdown() {
        // no workers, so the task can only be dropped by the shutdown
        let server = start(MockLoader::default(), 0, DEFAULT_MAX_FRAME_LEN).await;
        let mut client = Client::connect(server.addr).await.unwrap();
        let options = TranscribeOptions {
            is_async: true,
            ..TranscribeOptions::default()
        };
        let ServerMessage::Status(TaskStatus::Accepted { task_id }) = client
            .transcribe_data(b"RIFF", options)
            .await
            .unwrap()
        else {
            panic!("not accepted");
        };
        assert_eq!(server.state.queue.len(), 1);

        server.shutdown.cancel();
        server.handle.await.unwrap();
        assert!(server.state.queue.is_empty());
        assert_eq!(
            server.state.results.take_if_done(&task_id),
            TaskResult::Failed("server shutting down".into())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_accepting_and_closes_idle_connections() {
        let server = start(MockLoader::default(), 2, DEFAULT_MAX_FRAME_LEN).await;
        let mut idle = TcpStream::connect(server.addr).await.unwrap();
        // make sure the connection is being served before shutting down
        idle.write_all(&encode_frame(br#"{"command":"queue_status"}"#))
            .await
            .unwrap();
        read_frame(&mut idle, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();

        server.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(read_frame(&mut idle, DEFAULT_MAX_FRAME_LEN).await.unwrap().is_none());
        assert!(TcpStream::connect(server.addr).await.is_err());
    }
}

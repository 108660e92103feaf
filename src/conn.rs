use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{CloseReason, ProtocolViolation};
use crate::framer::Framer;
use crate::id::ConnId;
use crate::lifecycle::Lifecycle;
use crate::mailbox::{MailboxRx, mailbox};
use crate::message::Message;
use crate::protocol::{Command, parse_command, parse_name};
use crate::registry::Member;
use crate::router::RouterHandle;
use crate::state::ServerState;

/// Upper bound on writing a parting notice to a client that may not read.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive one client from handshake to teardown.
///
/// The reader runs on the calling task, the sender on a spawned one. Whatever
/// ends the session first (EOF, `/quit`, an I/O or protocol error, eviction,
/// server shutdown) wins the lifecycle's close; the teardown below then runs
/// exactly once: stop the sender (closing the mailbox and our side of the
/// transport), unregister, then announce the departure.
pub async fn handle<S>(state: ServerState, stream: S) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = Framer::new(reader, state.config.max_line_len);
    let lifecycle = Lifecycle::new();

    let name = match handshake(&state, &mut lines).await {
        Ok(name) => name,
        Err(reason) => {
            debug!(%reason, "handshake failed");
            lifecycle.close(reason.clone());
            farewell(&mut writer, &reason).await;
            lifecycle.finish();
            return reason;
        }
    };

    let id = ConnId::generate();
    let (mailbox_tx, mailbox_rx) = mailbox(state.config.mailbox_capacity);
    lifecycle.activate();

    let member = Member {
        id,
        name: name.clone(),
        mailbox: mailbox_tx,
        lifecycle: lifecycle.clone(),
    };
    if let Err(err) = state.registry.register(member).await {
        let reason = CloseReason::Rejected(err);
        lifecycle.close(reason.clone());
        farewell(&mut writer, &reason).await;
        lifecycle.finish();
        return reason;
    }

    // close_all may have run before we were registered
    if state.is_shutting_down() {
        lifecycle.close(CloseReason::ServerShutdown);
    }

    let members = state.registry.len().await;
    info!(conn_id = %id, name = %name, members, "joined");
    if !state.router.submit(Message::joined(id, &name)).await {
        debug!(conn_id = %id, "router stopped, join notice dropped");
    }

    let sender = tokio::spawn(send_loop(writer, mailbox_rx, lifecycle.clone()));
    read_loop(&mut lines, &state.router, &lifecycle, id, &name).await;

    // the sender closes the mailbox on exit, so nothing is enqueued after
    // the member is gone
    if let Err(err) = sender.await {
        warn!(conn_id = %id, error = %err, "sender task failed");
    }
    state.registry.unregister(id).await;
    if !state.router.submit(Message::left(id, &name)).await {
        debug!(conn_id = %id, "router stopped, leave notice dropped");
    }
    drop(lines);
    lifecycle.finish();

    let reason = lifecycle
        .reason()
        .cloned()
        .unwrap_or(CloseReason::PeerClosed);
    info!(conn_id = %id, name = %name, %reason, "left");
    reason
}

async fn handshake<R>(state: &ServerState, lines: &mut Framer<R>) -> Result<String, CloseReason>
where
    R: AsyncRead + Unpin,
{
    let first = tokio::select! {
        _ = state.shutdown_requested() => return Err(CloseReason::ServerShutdown),
        first = timeout(state.config.handshake_timeout, lines.next_line()) => first,
    };

    match first {
        Err(_) => Err(CloseReason::Protocol(ProtocolViolation::HandshakeTimeout)),
        Ok(Ok(Some(line))) => parse_name(&line).map_err(CloseReason::Protocol),
        Ok(Ok(None)) => Err(CloseReason::PeerClosed),
        Ok(Err(err)) => Err(err.into()),
    }
}

async fn read_loop<R>(
    lines: &mut Framer<R>,
    router: &RouterHandle,
    lifecycle: &Lifecycle,
    id: ConnId,
    name: &str,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = lifecycle.closing() => return,
            next = lines.next_line() => next,
        };

        let text = match next {
            Ok(Some(line)) => match parse_command(line) {
                Command::Quit => {
                    lifecycle.close(CloseReason::Quit);
                    return;
                }
                Command::Say(text) => text,
            },
            Ok(None) => {
                lifecycle.close(CloseReason::PeerClosed);
                return;
            }
            Err(err) => {
                lifecycle.close(err.into());
                return;
            }
        };

        debug!(conn_id = %id, bytes = text.len(), "received");
        let submitted = tokio::select! {
            biased;
            _ = lifecycle.closing() => return,
            ok = router.submit(Message::chat(id, name, text)) => ok,
        };
        if !submitted {
            lifecycle.close(CloseReason::ServerShutdown);
            return;
        }
    }
}

async fn send_loop<W>(mut writer: W, mut mailbox: MailboxRx, lifecycle: Lifecycle)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = lifecycle.closing() => break,
            msg = mailbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let line = msg.render();
        let written = tokio::select! {
            biased;
            _ = lifecycle.closing() => break,
            res = write_line(&mut writer, &line) => res,
        };
        if let Err(err) = written {
            lifecycle.close(CloseReason::Transport(err.to_string()));
            break;
        }
    }

    mailbox.close();
    if let Some(reason) = lifecycle.reason() {
        farewell(&mut writer, reason).await;
    }
}

/// Best-effort parting notice, then close our side of the transport.
async fn farewell<W>(writer: &mut W, reason: &CloseReason)
where
    W: AsyncWrite + Unpin,
{
    let parting = async {
        if let Some(notice) = reason.notice() {
            write_line(writer, &notice).await?;
        }
        writer.shutdown().await
    };

    match timeout(FAREWELL_TIMEOUT, parting).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "farewell write failed"),
        Err(_) => debug!("farewell timed out"),
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf, duplex};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<CloseReason>,
    }

    impl Client {
        fn connect(state: &ServerState) -> Self {
            Self::connect_with_buffer(state, 64 * 1024)
        }

        fn connect_with_buffer(state: &ServerState, buffer: usize) -> Self {
            let (client, server) = duplex(buffer);
            let task = tokio::spawn(handle(state.clone(), server));
            let (reader, writer) = tokio::io::split(client);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
                task,
            }
        }

        async fn join(state: &ServerState, name: &str) -> Self {
            Self::join_with_buffer(state, name, 64 * 1024).await
        }

        async fn join_with_buffer(state: &ServerState, name: &str, buffer: usize) -> Self {
            let mut client = Self::connect_with_buffer(state, buffer);
            client.send(name).await;
            client.expect(&format!("{name} has joined the chat")).await;
            client
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(WAIT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
        }

        async fn expect(&mut self, want: &str) {
            assert_eq!(self.recv().await.as_deref(), Some(want));
        }

        async fn finished(self) -> CloseReason {
            timeout(WAIT, self.task).await.unwrap().unwrap()
        }
    }

    /// Reads normally, fails every write.
    struct RefusesWrites(DuplexStream);

    impl AsyncRead for RefusesWrites {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for RefusesWrites {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn state_with(f: impl FnOnce(&mut Config)) -> ServerState {
        let mut config = Config::default();
        f(&mut config);
        ServerState::start(config)
    }

    #[tokio::test]
    async fn two_clients_chat_and_one_quits() {
        let state = state_with(|_| {});
        let mut alice = Client::join(&state, "alice").await;
        let mut bob = Client::join(&state, "bob").await;
        alice.expect("bob has joined the chat").await;

        alice.send("hello").await;
        alice.expect("alice> hello").await;
        bob.expect("alice> hello").await;

        bob.send("/quit").await;
        alice.expect("bob has left the chat").await;
        assert_eq!(bob.recv().await, None);
        assert_eq!(bob.finished().await, CloseReason::Quit);
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn name_is_trimmed() {
        let state = state_with(|_| {});
        let mut carol = Client::connect(&state);
        carol.send("  carol \r").await;
        carol.expect("carol has joined the chat").await;
        assert_eq!(state.registry.snapshot().await[0].name, "carol");
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let state = state_with(|_| {});
        let mut anon = Client::connect(&state);
        anon.send("   ").await;

        anon.expect("error: display name must not be empty").await;
        assert_eq!(anon.recv().await, None);
        assert_eq!(
            anon.finished().await,
            CloseReason::Protocol(ProtocolViolation::EmptyName)
        );
        assert_eq!(state.registry.len().await, 0);
    }

    #[tokio::test]
    async fn silent_client_times_out_in_handshake() {
        let state = state_with(|c| c.handshake_timeout = Duration::from_millis(50));
        let mut mute = Client::connect(&state);

        mute.expect("error: no display name received in time").await;
        assert_eq!(
            mute.finished().await,
            CloseReason::Protocol(ProtocolViolation::HandshakeTimeout)
        );
    }

    #[tokio::test]
    async fn oversized_line_closes_only_the_offender() {
        let state = state_with(|c| c.max_line_len = 16);
        let mut alice = Client::join(&state, "alice").await;
        let mut bob = Client::join(&state, "bob").await;
        alice.expect("bob has joined the chat").await;

        let exact = "x".repeat(16);
        bob.send(&exact).await;
        bob.expect(&format!("bob> {exact}")).await;
        alice.expect(&format!("bob> {exact}")).await;

        bob.send(&"y".repeat(17)).await;
        bob.expect("error: line too long").await;
        assert_eq!(bob.recv().await, None);
        assert_eq!(
            bob.finished().await,
            CloseReason::Protocol(ProtocolViolation::LineTooLong)
        );

        alice.expect("bob has left the chat").await;
        alice.send("still here").await;
        alice.expect("alice> still here").await;
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn quit_racing_eof_announces_departure_once() {
        let state = state_with(|_| {});
        let mut alice = Client::join(&state, "alice").await;
        let mut bob = Client::join(&state, "bob").await;
        alice.expect("bob has joined the chat").await;

        bob.send("/quit").await;
        bob.writer.shutdown().await.unwrap();
        drop(bob.lines);
        assert_eq!(timeout(WAIT, bob.task).await.unwrap().unwrap(), CloseReason::Quit);

        alice.expect("bob has left the chat").await;
        alice.send("ping").await;
        alice.expect("alice> ping").await;
    }

    #[tokio::test]
    async fn peer_hangup_is_a_close() {
        let state = state_with(|_| {});
        let mut alice = Client::join(&state, "alice").await;
        let bob = Client::join(&state, "bob").await;
        alice.expect("bob has joined the chat").await;

        drop(bob.lines);
        drop(bob.writer);
        assert_eq!(timeout(WAIT, bob.task).await.unwrap().unwrap(), CloseReason::PeerClosed);
        alice.expect("bob has left the chat").await;
    }

    #[tokio::test]
    async fn messages_from_one_sender_arrive_in_order() {
        let state = state_with(|_| {});
        let mut alice = Client::join(&state, "alice").await;
        let mut bob = Client::join(&state, "bob").await;
        alice.expect("bob has joined the chat").await;

        for i in 0..20 {
            alice.send(&format!("m{i}")).await;
        }
        for client in [&mut alice, &mut bob] {
            for i in 0..20 {
                client.expect(&format!("alice> m{i}")).await;
            }
        }
    }

    #[tokio::test]
    async fn server_shutdown_closes_members() {
        let state = state_with(|_| {});
        let mut alice = Client::join(&state, "alice").await;

        assert_eq!(state.shutdown().await, 1);
        alice.expect("server shutting down").await;
        assert_eq!(alice.recv().await, None);
        assert_eq!(alice.finished().await, CloseReason::ServerShutdown);
        assert_eq!(state.registry.len().await, 0);

        let mut late = Client::connect(&state);
        late.expect("server shutting down").await;
        assert_eq!(late.finished().await, CloseReason::ServerShutdown);
    }

    #[tokio::test]
    async fn stalled_reader_is_evicted_as_slow_consumer() {
        let state = state_with(|c| {
            c.mailbox_capacity = 2;
            c.send_timeout = Duration::from_millis(20);
        });
        // joins first and then never reads again
        let slow = Client::join_with_buffer(&state, "slow", 64).await;
        let mut alice = Client::join(&state, "alice").await;

        for i in 0..50 {
            alice.send(&format!("flood {i}")).await;
        }

        assert_eq!(slow.finished().await, CloseReason::SlowConsumer);

        let mut saw_left = false;
        for _ in 0..60 {
            if alice.recv().await.as_deref() == Some("slow has left the chat") {
                saw_left = true;
                break;
            }
        }
        assert!(saw_left);
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn write_failure_closes_with_transport_error() {
        let state = state_with(|_| {});
        let mut alice = Client::join(&state, "alice").await;

        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(handle(state.clone(), RefusesWrites(server)));
        client.write_all(b"mallory\n").await.unwrap();

        alice.expect("mallory has joined the chat").await;
        alice.expect("mallory has left the chat").await;

        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(reason, CloseReason::Transport(_)), "got {reason:?}");
        assert_eq!(state.registry.len().await, 1);
        drop(client);
    }
}

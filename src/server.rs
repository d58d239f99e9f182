//! IPC server: local-socket clients, framed packets, fd passing.
//!
//! The listener and every connection are event sources on the compositor's
//! loop. Reads go through `recvmsg` so `SCM_RIGHTS` descriptors ride along
//! with the byte stream; a connection queues received fds and the decoder
//! attaches them to the packets that need one. Writes are buffered and
//! flushed opportunistically; a connection whose backlog outgrows the bound
//! is closed rather than buffered without limit.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, IoSliceMut, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::rc::{Rc, Weak};

use anyhow::{Context, Result};
use glint_ipc::wire::FrameBuffer;
use glint_ipc::Packet;
use mio::Token;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use tracing::{debug, info, warn};

use crate::event_loop::{EventSource, LoopHandle, Readiness};
use crate::signal::Signal;

pub type ConnectionId = u32;

/// Close a connection whose unsent backlog exceeds this.
const MAX_SEND_BACKLOG: usize = 1024 * 1024;

/// Descriptors accepted per recvmsg; one per fd-bearing packet in practice.
const MAX_FDS_PER_MSG: usize = 4;

struct ServerState {
    connections: HashMap<ConnectionId, Rc<RefCell<Connection>>>,
    next_id: ConnectionId,
}

struct ServerShared {
    connected: Signal<ConnectionId>,
    packet: Signal<(ConnectionId, Packet)>,
    state: RefCell<ServerState>,
    handle: LoopHandle,
}

/// Handle to the running server. Clones share the listener and the
/// connection table.
#[derive(Clone)]
pub struct IpcServer {
    shared: Rc<ServerShared>,
}

impl IpcServer {
    /// Unlink-and-bind at `path`, register with the loop, start accepting.
    pub fn bind(path: &Path, handle: LoopHandle) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        listener.set_nonblocking(true)?;

        let shared = Rc::new(ServerShared {
            connected: Signal::new(),
            packet: Signal::new(),
            state: RefCell::new(ServerState {
                connections: HashMap::new(),
                next_id: 1,
            }),
            handle,
        });

        let source = Rc::new(RefCell::new(ListenerSource {
            listener,
            shared: shared.clone(),
        }));
        shared.handle.register_source(source, false)?;

        info!("listening on {}", path.display());
        Ok(Self { shared })
    }

    /// Emitted with the new connection id after accept.
    pub fn connected(&self) -> &Signal<ConnectionId> {
        &self.shared.connected
    }

    /// Emitted for every fully-read packet. Emission happens inside the
    /// connection's dispatch; use queued slots to write back to the peer.
    pub fn packets(&self) -> &Signal<(ConnectionId, Packet)> {
        &self.shared.packet
    }

    /// Send to one connection; unknown ids are ignored.
    pub fn send(&self, id: ConnectionId, packet: &Packet) {
        let connection = self.shared.state.borrow().connections.get(&id).cloned();
        if let Some(connection) = connection {
            connection.borrow_mut().send(packet);
        }
    }

    /// Send to every live connection. One connection failing only closes
    /// that connection.
    pub fn broadcast(&self, packet: &Packet) {
        let connections: Vec<_> = self
            .shared
            .state
            .borrow()
            .connections
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.borrow_mut().send(packet);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.state.borrow().connections.len()
    }
}

struct ListenerSource {
    listener: UnixListener,
    shared: Rc<ServerShared>,
}

impl EventSource for ListenerSource {
    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn dispatch(&mut self, _readiness: Readiness) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = accept_connection(&self.shared, stream) {
                        warn!("failed to accept client: {e:#}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accept failed"),
            }
        }
        Ok(())
    }
}

fn accept_connection(shared: &Rc<ServerShared>, stream: UnixStream) -> Result<()> {
    stream.set_nonblocking(true)?;

    let id = {
        let mut state = shared.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        id
    };

    let connection = Rc::new(RefCell::new(Connection {
        id,
        stream,
        token: None,
        frames: FrameBuffer::new(),
        fds: VecDeque::new(),
        send_buf: VecDeque::new(),
        writing: false,
        closed: false,
        shared: Rc::downgrade(shared),
    }));

    let token = shared.handle.register_source(connection.clone(), false)?;
    connection.borrow_mut().token = Some(token);
    shared.state.borrow_mut().connections.insert(id, connection);

    info!("client {id} connected");
    shared.connected.emit(&id);
    Ok(())
}

/// One accepted peer: partial-read accumulator, received-fd queue and a
/// bounded send buffer. Lifetime runs from accept to EOF or error.
struct Connection {
    id: ConnectionId,
    stream: UnixStream,
    token: Option<Token>,
    frames: FrameBuffer,
    fds: VecDeque<OwnedFd>,
    send_buf: VecDeque<u8>,
    writing: bool,
    closed: bool,
    shared: Weak<ServerShared>,
}

impl EventSource for Connection {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn dispatch(&mut self, readiness: Readiness) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if readiness.writable {
            if let Err(e) = self.flush() {
                self.close(&format!("write error: {e}"));
                return Ok(());
            }
            self.update_interest();
        }
        if readiness.readable && !self.closed {
            self.read_ready();
        }
        Ok(())
    }
}

impl Connection {
    fn read_ready(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            let bytes = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MSG]);
                match recvmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let mut raw_fds = Vec::new();
                        for cmsg in msg.cmsgs() {
                            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                                raw_fds.extend(fds);
                            }
                        }
                        let bytes = msg.bytes;
                        for fd in raw_fds {
                            // Safety: SCM_RIGHTS delivered this descriptor to
                            // us; we are its sole owner from here on.
                            self.fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                        bytes
                    }
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        self.close(&format!("read error: {e}"));
                        return;
                    }
                }
            };
            if bytes == 0 {
                self.close("eof");
                return;
            }
            self.frames.extend(&buf[..bytes]);
        }
        self.process_frames();
    }

    fn process_frames(&mut self) {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        while !self.closed {
            match self.frames.next_frame() {
                Ok(Some(body)) => match Packet::decode(&body, &mut self.fds) {
                    Ok(packet) => shared.packet.emit(&(self.id, packet)),
                    Err(e) => debug!("client {}: dropped frame ({e})", self.id),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("client {}: {e}", self.id);
                    self.close("unrecoverable frame length");
                    break;
                }
            }
        }
    }

    fn send(&mut self, packet: &Packet) {
        if self.closed {
            return;
        }
        let frame = packet.encode();
        if self.send_buf.len() + frame.len() > MAX_SEND_BACKLOG {
            warn!("client {}: send backlog exceeded", self.id);
            self.close("send backlog exceeded");
            return;
        }
        self.send_buf.extend(frame);
        match self.flush() {
            Ok(()) => self.update_interest(),
            Err(e) => self.close(&format!("write error: {e}")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.send_buf.is_empty() {
            let (front, _) = self.send_buf.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn update_interest(&mut self) {
        let want_write = !self.send_buf.is_empty();
        if want_write == self.writing {
            return;
        }
        self.writing = want_write;
        if let (Some(token), Some(shared)) = (self.token, self.shared.upgrade()) {
            if let Err(e) = shared.handle.reregister_source(token, want_write) {
                warn!("client {}: failed to update interest: {e:#}", self.id);
            }
        }
    }

    /// Terminal and silent, per the transport error policy.
    fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("client {} disconnected ({reason})", self.id);
        if let Some(shared) = self.shared.upgrade() {
            if let Some(token) = self.token.take() {
                shared.handle.unregister_source(token).ok();
            }
            shared.state.borrow_mut().connections.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use glint_ipc::wire::Writer;
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn scratch_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("glint-server-{}-{tag}.sock", std::process::id()))
    }

    fn pump(event_loop: &mut EventLoop, turns: usize) {
        for _ in 0..turns {
            event_loop.dispatch(Some(Duration::from_millis(20))).unwrap();
        }
    }

    struct Fixture {
        event_loop: EventLoop,
        server: IpcServer,
        packets: Rc<RefCell<Vec<(ConnectionId, Packet)>>>,
        path: PathBuf,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let event_loop = EventLoop::new().unwrap();
            let handle = event_loop.handle();
            let path = scratch_socket(tag);
            let server = IpcServer::bind(&path, handle.clone()).unwrap();

            let packets = Rc::new(RefCell::new(Vec::new()));
            let sink = packets.clone();
            server
                .packets()
                .connect_queued(&handle, move |entry| sink.borrow_mut().push(entry));

            Self {
                event_loop,
                server,
                packets,
                path,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            fs::remove_file(&self.path).ok();
        }
    }

    #[test]
    fn test_framed_packet_reaches_the_signal() {
        let mut fx = Fixture::new("basic");
        let mut client = UnixStream::connect(&fx.path).unwrap();
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.server.connection_count(), 1);

        let frame = Packet::UnregisterSurface { name: "a".into() }.encode();
        client.write_all(&frame).unwrap();
        pump(&mut fx.event_loop, 2);

        let packets = fx.packets.borrow();
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            &packets[0].1,
            Packet::UnregisterSurface { name } if name == "a"
        ));
    }

    #[test]
    fn test_split_frame_across_writes() {
        let mut fx = Fixture::new("split");
        let mut client = UnixStream::connect(&fx.path).unwrap();
        pump(&mut fx.event_loop, 2);

        let frame = Packet::SetSurfaceStrata { name: "panel".into(), strata: 3 }.encode();
        client.write_all(&frame[..5]).unwrap();
        pump(&mut fx.event_loop, 2);
        assert!(fx.packets.borrow().is_empty());

        client.write_all(&frame[5..]).unwrap();
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.packets.borrow().len(), 1);
    }

    #[test]
    fn test_unknown_opcode_keeps_connection_open() {
        let mut fx = Fixture::new("badop");
        let mut client = UnixStream::connect(&fx.path).unwrap();
        pump(&mut fx.event_loop, 2);

        let mut bogus = Writer::new();
        bogus.put_u32(0xdead_beef);
        bogus.put_str("junk");
        client.write_all(&bogus.into_frame()).unwrap();
        client
            .write_all(&Packet::UnregisterSurface { name: "a".into() }.encode())
            .unwrap();
        pump(&mut fx.event_loop, 2);

        assert_eq!(fx.server.connection_count(), 1);
        let packets = fx.packets.borrow();
        assert_eq!(packets.len(), 1);
        assert!(matches!(&packets[0].1, Packet::UnregisterSurface { .. }));
    }

    #[test]
    fn test_oversized_length_closes_connection() {
        let mut fx = Fixture::new("oversized");
        let mut client = UnixStream::connect(&fx.path).unwrap();
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.server.connection_count(), 1);

        client.write_all(&u32::MAX.to_le_bytes()).unwrap();
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.server.connection_count(), 0);
    }

    #[test]
    fn test_disconnect_drops_connection() {
        let mut fx = Fixture::new("eof");
        let client = UnixStream::connect(&fx.path).unwrap();
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.server.connection_count(), 1);

        drop(client);
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.server.connection_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let mut fx = Fixture::new("broadcast");
        let mut clients = [
            UnixStream::connect(&fx.path).unwrap(),
            UnixStream::connect(&fx.path).unwrap(),
        ];
        pump(&mut fx.event_loop, 2);
        assert_eq!(fx.server.connection_count(), 2);

        fx.server
            .broadcast(&Packet::DisplaySize { width: 800, height: 600 });
        pump(&mut fx.event_loop, 2);

        for client in &mut clients {
            client
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            let mut frame = vec![0u8; 16];
            client.read_exact(&mut frame).unwrap();
            let mut fds = VecDeque::new();
            match Packet::decode(&frame[4..], &mut fds).unwrap() {
                Packet::DisplaySize { width, height } => {
                    assert_eq!((width, height), (800, 600));
                }
                other => panic!("wrong packet: {other:?}"),
            }
        }
    }

    #[test]
    fn test_fd_arrives_with_shm_registration() {
        use nix::sys::socket::{sendmsg, ControlMessage};
        use std::io::IoSlice;

        let mut fx = Fixture::new("scm");
        let client = UnixStream::connect(&fx.path).unwrap();
        pump(&mut fx.event_loop, 2);

        let file = std::fs::File::open("/dev/null").unwrap();
        let frame = Packet::RegisterSurfaceShm {
            name: "cursor".into(),
            width: 16,
            height: 16,
            fd: Arc::new(OwnedFd::from(std::fs::File::open("/dev/null").unwrap())),
        }
        .encode();

        let iov = [IoSlice::new(&frame)];
        let fds = [file.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(
            client.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .unwrap();
        pump(&mut fx.event_loop, 2);

        let packets = fx.packets.borrow();
        assert_eq!(packets.len(), 1);
        match &packets[0].1 {
            Packet::RegisterSurfaceShm { name, width, height, .. } => {
                assert_eq!(name, "cursor");
                assert_eq!((*width, *height), (16, 16));
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }
}

//! Single-threaded, epoll-driven event loop: accept, readiness multiplex,
//! drain-parse-dispatch, backpressure.
//!
//! Grounded on this codebase's `SocketServer` — an `epoll_create1`-backed
//! server struct holding the listener, a signalfd, and a `Slab` of
//! connections keyed by the epoll userdata, with two reserved high-valued
//! keys distinguishing listener/signal events from per-client ones. The
//! `bind`/`wait` shape and the owned-`Fd` RAII wrapper are kept close to
//! the original; the listener is TCP instead of a Unix socket, interest is
//! level-triggered rather than edge-triggered (frames can remain buffered
//! across multiple wakeups), and the client slab is capacity-bounded for
//! admission control instead of growing freely.

use crate::{
	commands,
	connection::Connection,
	keyspace::Keyspace,
	proto::{self, ParseResult},
};
use log::{debug, trace, warn};
use nix::{
	sys::{
		epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp},
		signal::{SigSet, Signal},
		signalfd::{signalfd, SfdFlags},
	},
	unistd::close,
};
use slab::Slab;
use std::{
	io::{ErrorKind, Read, Result, Write},
	net::{TcpListener, TcpStream},
	os::unix::io::{AsRawFd, RawFd},
	time::Duration,
};

/// Upper bound on simultaneously open connections; a trivial form of
/// backpressure against accept storms.
const MAX_CLIENTS: usize = 1024;

/// Scratch buffer size for one `recv` call.
const RECV_CHUNK: usize = 4096;

const SERV_KEY: u64 = u64::MAX;
const SIGNALFD_KEY: u64 = u64::MAX - 1;

pub struct Server {
	epoll: Fd,
	listener: TcpListener,
	_sigfd: Fd,
	keyspace: Keyspace,
	clients: Slab<Client>,
}

struct Client {
	sock: TcpStream,
	conn: Connection,
}

impl Server {
	pub fn bind(port: u16) -> Result<Self> {
		let epoll = Fd(epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?);
		trace!("created epollfd {epoll:?}");

		let listener = TcpListener::bind(("0.0.0.0", port))?;
		listener.set_nonblocking(true)?;
		trace!("created listener {listener:?}");
		epoll_ctl(
			epoll.as_raw_fd(),
			EpollOp::EpollCtlAdd,
			listener.as_raw_fd(),
			&mut Some(EpollEvent::new(EpollFlags::EPOLLIN, SERV_KEY)),
		)?;
		trace!("registered listener with epoll");

		let sigfd = {
			let mut signals = SigSet::empty();
			signals.add(Signal::SIGINT);
			signals.add(Signal::SIGTERM);
			signals.thread_block()?;
			Fd(signalfd(-1, &signals, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?)
		};
		trace!("created signalfd {sigfd:?}");
		epoll_ctl(
			epoll.as_raw_fd(),
			EpollOp::EpollCtlAdd,
			sigfd.as_raw_fd(),
			&mut Some(EpollEvent::new(EpollFlags::EPOLLIN, SIGNALFD_KEY)),
		)?;
		trace!("registered signalfd with epoll");

		Ok(Self { epoll, listener, _sigfd: sigfd, keyspace: Keyspace::new(), clients: Slab::new() })
	}

	/// Run until a shutdown signal arrives. On return, every connection has
	/// already been torn down.
	pub fn run(&mut self) -> Result<()> {
		loop {
			if self.wait(Duration::from_millis(1000))? {
				debug!("shutdown signal received");
				break;
			}
		}
		Ok(())
	}

	/// One readiness cycle. Returns `true` if shutdown was requested.
	fn wait(&mut self, timeout: Duration) -> Result<bool> {
		let mut events = [EpollEvent::empty(); 32];
		let n = match epoll_wait(self.epoll.as_raw_fd(), &mut events, timeout.as_millis() as isize) {
			Ok(n) => n,
			Err(nix::errno::Errno::EINTR) => return Ok(false),
			Err(err) => return Err(err.into()),
		};
		trace!("epoll_wait returned {n}");

		for ev in &events[..n] {
			match ev.data() {
				SERV_KEY => self.accept_loop()?,
				SIGNALFD_KEY => return Ok(true),
				key => self.service_client(key as usize),
			}
		}
		Ok(false)
	}

	fn accept_loop(&mut self) -> Result<()> {
		loop {
			match self.listener.accept() {
				Ok((sock, addr)) => {
					debug!("accepted connection from {addr}");
					if self.clients.len() >= MAX_CLIENTS {
						debug!("connection table full, dropping new connection");
						continue; // socket dropped here: admission control
					}
					sock.set_nonblocking(true)?;
					let fd = sock.as_raw_fd();
					let entry = self.clients.vacant_entry();
					let key = entry.key();
					epoll_ctl(
						self.epoll.as_raw_fd(),
						EpollOp::EpollCtlAdd,
						fd,
						&mut Some(EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT, key as u64)),
					)?;
					entry.insert(Client { sock, conn: Connection::new() });
					trace!("registered client {key} with epoll");
				},
				Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
				Err(err) => return Err(err),
			}
		}
	}

	fn service_client(&mut self, key: usize) {
		let Some(client) = self.clients.get_mut(key) else {
			warn!("epoll_wait produced an event with unknown userdata {key}");
			return;
		};

		match service(client, &mut self.keyspace) {
			Ok(ShouldClose::Keep) => (),
			Ok(ShouldClose::Close) => {
				debug!("closing connection {key}");
				self.clients.remove(key);
			},
			Err(err) => {
				warn!("connection {key} failed: {err}");
				self.clients.remove(key);
			},
		}
	}
}

enum ShouldClose {
	Keep,
	Close,
}

/// Drive one connection: read what's available, parse and dispatch every
/// complete frame, then flush as much of the write buffer as the socket
/// will accept.
fn service(client: &mut Client, keyspace: &mut Keyspace) -> Result<ShouldClose> {
	let mut scratch = [0u8; RECV_CHUNK];
	loop {
		match client.sock.read(&mut scratch) {
			Ok(0) => return Ok(ShouldClose::Close),
			Ok(n) => client.conn.read_buf.append(&scratch[..n]),
			Err(err) if err.kind() == ErrorKind::WouldBlock => break,
			Err(err) => return Err(err),
		}
	}

	loop {
		match proto::parse(client.conn.read_buf.data()) {
			ParseResult::NeedMore => break,
			ParseResult::Malformed => {
				client.conn.append_write(b"-ERR Protocol error\r\n");
				flush(client)?;
				return Ok(ShouldClose::Close);
			},
			ParseResult::Parsed(value, n) => {
				client.conn.read_buf.mark_consumed(n);
				let mut reply = Vec::new();
				commands::dispatch(keyspace, &value, &mut reply);
				client.conn.append_write(&reply);
			},
		}
	}

	flush(client)?;
	Ok(ShouldClose::Keep)
}

/// Send as much of the write buffer as the socket will currently accept.
fn flush(client: &mut Client) -> Result<()> {
	loop {
		let data = client.conn.write_buf.data();
		if data.is_empty() {
			return Ok(());
		}
		match client.sock.write(data) {
			Ok(0) => return Err(ErrorKind::WriteZero.into()),
			Ok(n) => client.conn.write_buf.mark_consumed(n),
			Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
			Err(err) => return Err(err),
		}
	}
}

/// An owned file descriptor; closed on drop.
#[derive(Debug)]
struct Fd(RawFd);

impl AsRawFd for Fd {
	fn as_raw_fd(&self) -> RawFd {
		self.0
	}
}

impl Drop for Fd {
	fn drop(&mut self) {
		let _ = close(self.0);
	}
}

//! Length-prefixed message transport over a blocking `TcpStream`.
//!
//! An 8-byte little-endian length prefix precedes every payload. A
//! dedicated send-queue-draining writer thread owns the socket for writes;
//! a receive loop accumulates reads into a buffer and decodes messages out
//! of it while the buffer holds at least a full header and a full payload.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

const LENGTH_PREFIX_BYTES: usize = 8;
const MAX_PAYLOAD_BYTES: u64 = 64 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 128 * 1024;
const SOCKET_BUFFER_HINT_BYTES: usize = 256 * 1024;

/// Applies low-latency socket hints. Every setting is best-effort: a
/// rejected hint is logged and ignored, never fatal.
fn tune_socket(stream: &TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        log::warn!("failed to disable Nagle's algorithm: {}", error);
    }

    let socket = socket2::SockRef::from(stream);
    if let Err(error) = socket.set_send_buffer_size(SOCKET_BUFFER_HINT_BYTES) {
        log::warn!("failed to set send buffer hint: {}", error);
    }
    if let Err(error) = socket.set_recv_buffer_size(SOCKET_BUFFER_HINT_BYTES) {
        log::warn!("failed to set receive buffer hint: {}", error);
    }

    enable_quickack(stream);
}

#[cfg(target_os = "linux")]
fn enable_quickack(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let value: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        log::warn!("failed to enable TCP_QUICKACK: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_quickack(_stream: &TcpStream) {}

fn write_message(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    LittleEndian::write_u64(&mut header, payload.len() as u64);
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    Ok(())
}

/// Drains every complete message currently buffered, in transmission order.
fn drain_messages(buffer: &mut Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let mut messages = Vec::new();
    loop {
        if buffer.len() < LENGTH_PREFIX_BYTES {
            break;
        }
        let length = LittleEndian::read_u64(&buffer[..LENGTH_PREFIX_BYTES]);
        if length > MAX_PAYLOAD_BYTES {
            return Err(Error::Framing("length prefix exceeds sanity limit"));
        }
        let total = LENGTH_PREFIX_BYTES + length as usize;
        if buffer.len() < total {
            break;
        }
        messages.push(buffer[LENGTH_PREFIX_BYTES..total].to_vec());
        buffer.drain(..total);
    }
    Ok(messages)
}

fn send_worker(mut stream: TcpStream, rx: Receiver<Option<Vec<u8>>>) {
    loop {
        match rx.recv() {
            Ok(Some(payload)) => {
                if let Err(error) = write_message(&mut stream, &payload) {
                    log::error!("transport send worker stopping: {}", error);
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// One established connection. Owns the sole send-queue-draining writer
/// thread; `spawn_receive_worker` starts the sole reader thread with a
/// caller-supplied dispatch callback.
pub struct Transport {
    stream: TcpStream,
    send_tx: Sender<Option<Vec<u8>>>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Transport {
    pub fn connect(host: &str, port: u16) -> Result<Transport> {
        log::info!("connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port))?;
        Transport::from_stream(stream)
    }

    pub fn listen_and_accept(port: u16) -> Result<Transport> {
        log::info!("listening on 0.0.0.0:{}", port);
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let (stream, peer) = listener.accept()?;
        log::info!("accepted connection from {}", peer);
        Transport::from_stream(stream)
    }

    /// Wraps an already-connected stream (e.g. one handed back by a
    /// `TcpListener::accept` the caller drove directly).
    pub fn from_stream(stream: TcpStream) -> Result<Transport> {
        tune_socket(&stream);
        let write_stream = stream.try_clone()?;
        let (send_tx, send_rx) = mpsc::channel();
        let send_thread = thread::spawn(move || send_worker(write_stream, send_rx));
        Ok(Transport {
            stream,
            send_tx,
            send_thread: Mutex::new(Some(send_thread)),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Enqueues `payload` for transmission. Returns once it is queued, not
    /// once it is on the wire.
    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.send_tx.send(Some(payload)).map_err(|_| Error::Disconnected)
    }

    /// `false` once `stop` has run, e.g. from a Ctrl-C handler holding a
    /// shared reference to this transport. Lets a loop with no other
    /// wakeup source (no incoming frame, no local input) notice a forced
    /// shutdown instead of blocking past it.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the sole reader thread. `on_message` runs on that thread, in
    /// transmission order, once per complete payload.
    pub fn spawn_receive_worker<F>(&self, mut on_message: F) -> Result<JoinHandle<()>>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let mut read_stream = self.stream.try_clone()?;
        let running = self.running.clone();
        Ok(thread::spawn(move || {
            let mut buffer = Vec::new();
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            while running.load(Ordering::SeqCst) {
                let read = match read_stream.read(&mut chunk) {
                    Ok(0) => {
                        log::info!("peer closed the connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(error) => {
                        if running.load(Ordering::SeqCst) {
                            log::error!("transport receive worker stopping: {}", error);
                        }
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk[..read]);

                match drain_messages(&mut buffer) {
                    Ok(messages) => {
                        for message in messages {
                            on_message(message);
                        }
                    }
                    Err(error) => {
                        log::error!("framing error, terminating connection: {}", error);
                        break;
                    }
                }
            }
        }))
    }

    /// Closes the socket before joining the send worker: closing first is
    /// what unblocks a thread parked in a blocking read or write. Callable
    /// through a shared reference so a signal handler holding an `Arc` can
    /// force a clean shutdown from outside the owning threads.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = self.send_tx.send(None);
        if let Some(handle) = self.send_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_one_complete_message() {
        let mut buffer = Vec::new();
        let mut header = [0u8; 8];
        LittleEndian::write_u64(&mut header, 3);
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(b"abc");
        let messages = drain_messages(&mut buffer).unwrap();
        assert_eq!(messages, vec![b"abc".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn waits_for_a_partial_payload() {
        let mut buffer = Vec::new();
        let mut header = [0u8; 8];
        LittleEndian::write_u64(&mut header, 10);
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(b"ab");
        let messages = drain_messages(&mut buffer).unwrap();
        assert!(messages.is_empty());
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn rejects_an_oversized_length_prefix() {
        let mut buffer = Vec::new();
        let mut header = [0u8; 8];
        LittleEndian::write_u64(&mut header, MAX_PAYLOAD_BYTES + 1);
        buffer.extend_from_slice(&header);
        assert!(drain_messages(&mut buffer).is_err());
    }

    #[test]
    fn send_and_receive_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = Transport::from_stream(stream).unwrap();
            let (tx, rx) = mpsc::channel();
            let _receiver = transport.spawn_receive_worker(move |payload| {
                let _ = tx.send(payload);
            });
            let received = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
            transport.stop();
            received
        });

        let client = Transport::connect("127.0.0.1", port).unwrap();
        client.send(b"hello".to_vec()).unwrap();

        let received = server.join().unwrap();
        assert_eq!(received, b"hello".to_vec());
    }
}

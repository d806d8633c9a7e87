use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

const TEL_IAC: u8 = 255;
const TEL_WILL: u8 = 251;
const TEL_WONT: u8 = 252;
const TEL_DO: u8 = 253;
const TEL_DONT: u8 = 254;

const KEY_ESCAPE: u8 = 0x1C; // Ctrl-backslash
const KEY_HALT: u8 = 0x10; // Ctrl-P

// Negotiate a character-at-a-time binary session before anything else.
const TELNET_INIT: [u8; 15] = [
    255, 251, 34, // IAC WILL LINEMODE
    255, 251, 3, // IAC WILL SGA
    255, 251, 1, // IAC WILL ECHO
    255, 251, 0, // IAC WILL BINARY
    255, 253, 0, // IAC DO BINARY
];

/// What the reader thread hands to the machine loop. Everything here is
/// drained at instruction boundaries only; the thread never touches device
/// or processor state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleEvent {
    Char(u8),
    Connected,
    Disconnected,
    /// Halt-by-switch (Ctrl-P): transfer control back to the console ROM.
    HaltSwitch,
}

/// Inbound telnet option filtering: WILL/WONT/DO/DONT triplets are
/// discarded, IAC IAC yields a literal 0xFF, any other IAC pair is dropped.
/// State survives across reads since options can straddle buffers.
pub struct TelnetFilter {
    state: u8,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn filter(&mut self, input: &[u8], output: &mut Vec<u8>) {
        for &ch in input {
            match self.state {
                0 => {
                    if ch == TEL_IAC {
                        self.state = 1;
                    } else {
                        output.push(ch);
                    }
                }
                1 => match ch {
                    TEL_IAC => {
                        output.push(ch);
                        self.state = 0;
                    }
                    TEL_WILL | TEL_WONT | TEL_DO | TEL_DONT => {
                        self.state = 2;
                    }
                    _ => {
                        self.state = 0;
                    }
                },
                _ => {
                    self.state = 0;
                }
            }
        }
    }
}

/// A TCP console line. One listening socket, at most one active session.
/// Bytes travel to the machine through an mpsc channel; bytes travel back
/// through `send` on the shared stream handle.
pub struct Console {
    name: &'static str,
    event_rx: Receiver<ConsoleEvent>,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

struct Session {
    name: &'static str,
    halt_key_enabled: bool,
    event_tx: Sender<ConsoleEvent>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    telnet: TelnetFilter,
    last_seen: u8,
}

impl Console {
    /// Bind the listener and spawn the acceptor/reader thread. When
    /// `halt_key_enabled` is set, Ctrl-P becomes a halt-by-switch event
    /// instead of console input.
    pub fn listen(name: &'static str, port: u16, halt_key_enabled: bool) -> Result<Self, String> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| format!("can't bind console port {port}: {e}"))?;
        info!("Activating {name} console on TCP port {port}.");

        let (event_tx, event_rx) = channel();
        let stream = Arc::new(Mutex::new(None::<TcpStream>));
        let thread_stream = stream.clone();

        thread::spawn(move || {
            for incoming in listener.incoming() {
                let sock = match incoming {
                    Ok(sock) => sock,
                    Err(e) => {
                        warn!("{name}: accept failed: {e}");
                        continue;
                    }
                };
                if thread_stream.lock().unwrap().is_some() {
                    let mut sock = sock;
                    let _ = sock.write_all(
                        b"Console (CTY) connection already was taken.\r\n\
                          Check other terminal which has that connection.\r\n\
                          \r\nTerminated.\r\n",
                    );
                    continue;
                }

                let mut sock = sock;
                let _ = sock.write_all(&TELNET_INIT);
                let _ = sock.write_all(format!("Welcome to {name} Emulator\r\n\r\n").as_bytes());
                let reader = match sock.try_clone() {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("{name}: can't clone console socket: {e}");
                        continue;
                    }
                };
                *thread_stream.lock().unwrap() = Some(sock);

                let mut session = Session {
                    name,
                    halt_key_enabled,
                    event_tx: event_tx.clone(),
                    stream: thread_stream.clone(),
                    telnet: TelnetFilter::new(),
                    last_seen: 0,
                };
                let _ = session.event_tx.send(ConsoleEvent::Connected);
                session.run(reader);
            }
        });

        Ok(Self {
            name,
            event_rx,
            stream,
        })
    }

    /// Drain one pending event; called between instructions.
    pub fn poll(&self) -> Option<ConsoleEvent> {
        match self.event_rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }

    /// Put one character on the wire. A dead connection is simply dropped;
    /// the device's ready bit goes off and the OS sees a quiet terminal.
    pub fn send(&self, ch: u8) {
        let mut guard = self.stream.lock().unwrap();
        if let Some(sock) = guard.as_mut() {
            if sock.write_all(&[ch]).is_err() {
                debug!("{}: console connection lost on write", self.name);
                *guard = None;
            }
        }
    }
}

impl Session {
    fn run(&mut self, mut reader: TcpStream) {
        let mut raw = [0u8; 512];
        let mut filtered = Vec::with_capacity(512);
        loop {
            let len = match reader.read(&mut raw) {
                Ok(0) | Err(_) => {
                    self.close();
                    return;
                }
                Ok(len) => len,
            };
            filtered.clear();
            self.telnet.filter(&raw[..len], &mut filtered);

            for idx in 0..filtered.len() {
                let ch = filtered[idx];

                // Press ^\ twice to disconnect.
                if ch == KEY_ESCAPE {
                    if self.last_seen == KEY_ESCAPE {
                        self.close();
                        return;
                    }
                    self.last_seen = ch;
                    continue;
                }

                // Convert CR NL to CR line.
                if ch == 0o12 && self.last_seen == 0o15 {
                    continue;
                }
                self.last_seen = ch;

                // Ctrl-P returns the processor to its ROM console.
                if self.halt_key_enabled && ch == KEY_HALT {
                    let _ = self.event_tx.send(ConsoleEvent::HaltSwitch);
                    continue;
                }

                if self.event_tx.send(ConsoleEvent::Char(ch)).is_err() {
                    self.close();
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        debug!("{}: console session closed", self.name);
        *self.stream.lock().unwrap() = None;
        let _ = self.event_tx.send(ConsoleEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telnet_options_are_stripped() {
        let mut filter = TelnetFilter::new();
        let mut out = Vec::new();
        filter.filter(&[b'A', TEL_IAC, TEL_WILL, 34, b'B'], &mut out);
        assert_eq!(out, vec![b'A', b'B']);
    }

    #[test]
    fn doubled_iac_passes_as_data() {
        let mut filter = TelnetFilter::new();
        let mut out = Vec::new();
        filter.filter(&[TEL_IAC, TEL_IAC, b'x'], &mut out);
        assert_eq!(out, vec![0xFF, b'x']);
    }

    #[test]
    fn option_split_across_reads() {
        let mut filter = TelnetFilter::new();
        let mut out = Vec::new();
        filter.filter(&[b'a', TEL_IAC], &mut out);
        filter.filter(&[TEL_DO], &mut out);
        filter.filter(&[0, b'b'], &mut out);
        assert_eq!(out, vec![b'a', b'b']);
    }
}

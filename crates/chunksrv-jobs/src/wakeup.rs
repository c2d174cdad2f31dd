use mio::unix::pipe;
use std::io::{self, Read, Write};
use std::sync::Mutex;

/// The write end of the self-pipe a job pool uses to signal "status queue
/// non-empty" to the single-threaded reactor. Kept behind a `Mutex`
/// because every worker thread shares one sender.
pub struct WakeupSender {
    tx: Mutex<pipe::Sender>,
}

impl WakeupSender {
    /// Writes one byte, the same one-byte-per-coalesced-batch invariant
    /// the original's self-pipe relies on: a full pipe buffer means a
    /// wakeup byte is already pending, so a `WouldBlock` here is not an
    /// error.
    pub fn ping(&self) -> io::Result<()> {
        let mut tx = self.tx.lock().unwrap();
        match tx.write(&[0u8]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub fn new_wakeup() -> io::Result<(WakeupSender, pipe::Receiver)> {
    let (tx, rx) = pipe::new()?;
    Ok((WakeupSender { tx: Mutex::new(tx) }, rx))
}

/// Drains every pending byte off the self-pipe's read end. Called once
/// per readiness event before draining the status queue, so a burst of
/// `ping()` calls collapses into a single wakeup.
pub fn drain(rx: &mut pipe::Receiver) -> io::Result<usize> {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        match rx.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if n < buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

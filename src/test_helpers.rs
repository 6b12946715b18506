extern crate std;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Once;
use std::vec::Vec;

use embedded_io_async::{ErrorKind, ErrorType, Read, ReadReady, Write};

static INIT: Once = Once::new();

/// Route `log` output through `env_logger` when running with `--features log`.
pub fn init_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
            .is_test(true)
            .try_init()
            .ok();
    });
}

struct Step {
    expect: Vec<u8>,
    reply: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    /// Index into `tx` where the next expectation starts looking.
    cursor: usize,
    script: VecDeque<Step>,
    /// Replayed whenever `rx` runs dry.
    chatter: Vec<u8>,
}

/// Scripted modem. Every time the bytes written so far end with the next
/// expected sequence, its canned reply becomes readable.
#[derive(Clone, Default)]
pub struct MockSerial {
    inner: Rc<RefCell<Inner>>,
}

impl MockSerial {
    pub fn new() -> Self {
        init_logger();
        Self::default()
    }

    /// Make bytes readable right away.
    pub fn inject(&self, bytes: &[u8]) {
        self.inner.borrow_mut().rx.extend(bytes.iter().copied());
    }

    /// Keep the line busy with `bytes`, repeated forever.
    pub fn chatter(&self, bytes: &[u8]) {
        self.inner.borrow_mut().chatter = bytes.to_vec();
    }

    /// Queue a reply released once `expect` has been written.
    pub fn expect(&self, expect: &[u8], reply: &[u8]) -> &Self {
        self.inner.borrow_mut().script.push_back(Step {
            expect: expect.to_vec(),
            reply: reply.to_vec(),
        });
        self
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().tx.clone()
    }

    pub fn written_str(&self) -> std::string::String {
        std::string::String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Number of times `needle` appears in the written bytes.
    pub fn count(&self, needle: &[u8]) -> usize {
        self.inner
            .borrow()
            .tx
            .windows(needle.len())
            .filter(|w| *w == needle)
            .count()
    }

    /// Expectations not yet met.
    pub fn pending(&self) -> usize {
        self.inner.borrow().script.len()
    }

    pub fn unread(&self) -> usize {
        self.inner.borrow().rx.len()
    }
}

impl Inner {
    fn advance(&mut self) {
        while let Some(step) = self.script.front() {
            let window = &self.tx[self.cursor..];
            let Some(pos) = window
                .windows(step.expect.len().max(1))
                .position(|w| w == step.expect.as_slice())
            else {
                return;
            };
            self.cursor += pos + step.expect.len();
            if let Some(step) = self.script.pop_front() {
                self.rx.extend(step.reply);
            }
        }
    }
}

impl ErrorType for MockSerial {
    type Error = ErrorKind;
}

impl Read for MockSerial {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.rx.is_empty() {
            let chatter = inner.chatter.clone();
            inner.rx.extend(chatter);
        }
        let mut count = 0;
        while count < buf.len() {
            match inner.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl ReadReady for MockSerial {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let inner = self.inner.borrow();
        Ok(!inner.rx.is_empty() || !inner.chatter.is_empty())
    }
}

impl Write for MockSerial {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut inner = self.inner.borrow_mut();
        inner.tx.extend_from_slice(buf);
        inner.advance();
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

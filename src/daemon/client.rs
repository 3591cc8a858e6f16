//! Remote side of `turf -H`.
//!
//! Sends one request frame and waits for the response header. A `stop`
//! answered with EAGAIN (the realm has not been reaped yet) is retried on a
//! fresh connection from a loop timer, at most three times.
use crate::config::types::{ProtocolError, Result, TurfError};
use crate::event::{EventLoop, FileCallback, Mask, TimerCallback, TimerId, DEFAULT_SETSIZE};
use crate::ipc::frame::{encode_request, FrameHeader, FrameType, FRAME_HDR_LEN};
use log::{debug, info};
use nix::errno::Errno;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const MAX_STOP_RETRIES: u32 = 3;
pub const RETRY_INTERVAL_MS: u64 = 1000;

/// Daemon answer to a forwarded command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    /// 0 or a negated errno
    pub code: i32,
    /// EAGAIN retries spent before this answer
    pub retries: u32,
}

impl Reply {
    /// ECHILD after at least one retry means the realm went away while we
    /// were waiting, which is what `stop` asked for.
    pub fn into_result(self, is_stop: bool) -> Result<()> {
        if self.code == 0 || (is_stop && self.code == -libc::ECHILD && self.retries > 0) {
            return Ok(());
        }
        Err(TurfError::Sys(Errno::from_raw(-self.code)))
    }
}

#[derive(Clone, Debug)]
pub struct RemoteClient {
    socket_path: PathBuf,
    retry_ms: u64,
    max_retries: u32,
}

struct Exchange {
    socket_path: PathBuf,
    frame: Vec<u8>,
    is_stop: bool,
    retries: u32,
    max_retries: u32,
    retry_ms: u64,
    stream: Option<UnixStream>,
    reply: Option<Result<Reply>>,
}

impl RemoteClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            retry_ms: RETRY_INTERVAL_MS,
            max_retries: MAX_STOP_RETRIES,
        }
    }

    pub fn with_retry_interval(mut self, ms: u64) -> Self {
        self.retry_ms = ms;
        self
    }

    /// Forward `args` (without the program name) and return the raw reply.
    pub fn request(&self, args: &[String]) -> Result<Reply> {
        let frame = encode_request(args)?;
        let mut ex = Exchange {
            socket_path: self.socket_path.clone(),
            frame,
            is_stop: args.first().is_some_and(|cmd| cmd == "stop"),
            retries: 0,
            max_retries: self.max_retries,
            retry_ms: self.retry_ms,
            stream: None,
            reply: None,
        };

        let mut el: EventLoop<Exchange> = EventLoop::new(DEFAULT_SETSIZE)?;
        connect(&mut el, &mut ex)?;
        el.run(&mut ex)?;
        ex.reply.unwrap_or(Err(TurfError::Protocol(ProtocolError::Truncated {
            needed: FRAME_HDR_LEN,
            left: 0,
        })))
    }

    /// Forward `args` and map the reply to a result.
    pub fn send(&self, args: &[String]) -> Result<()> {
        let is_stop = args.first().is_some_and(|cmd| cmd == "stop");
        let reply = self.request(args)?;
        info!("rc={}", reply.code);
        reply.into_result(is_stop)
    }
}

fn connect(el: &mut EventLoop<Exchange>, ex: &mut Exchange) -> Result<()> {
    let mut stream = UnixStream::connect(&ex.socket_path).map_err(|e| {
        TurfError::NotFound(format!("daemon socket {}: {}", ex.socket_path.display(), e))
    })?;
    stream.write_all(&ex.frame)?;
    let cb: FileCallback<Exchange> = Rc::new(on_reply);
    el.create_event(stream.as_raw_fd(), Mask::READ, cb)?;
    debug!("request sent ({} bytes)", ex.frame.len());
    ex.stream = Some(stream);
    Ok(())
}

fn read_reply(stream: &mut UnixStream) -> Result<FrameHeader> {
    let mut buf = [0u8; FRAME_HDR_LEN];
    stream.read_exact(&mut buf)?;
    let hdr = FrameHeader::decode(&buf)?;
    if hdr.frame_type != FrameType::CliResponse as u8 {
        return Err(ProtocolError::UnexpectedType {
            expected: FrameType::CliResponse as u8,
            found: hdr.frame_type,
        }
        .into());
    }
    Ok(hdr)
}

fn on_reply(el: &mut EventLoop<Exchange>, ex: &mut Exchange, fd: RawFd, _mask: Mask) {
    let hdr = match ex.stream.as_mut() {
        Some(stream) => read_reply(stream),
        None => Err(TurfError::NotRunning("connection".to_string())),
    };
    let _ = el.delete_event(fd, Mask::ALL);
    ex.stream = None;

    let code = match hdr {
        Ok(hdr) => i32::from(hdr.code),
        Err(e) => {
            ex.reply = Some(Err(e));
            return;
        }
    };

    if ex.is_stop && code == -libc::EAGAIN {
        if ex.retries < ex.max_retries {
            ex.retries += 1;
            debug!("stop not finished, retry {}", ex.retries);
            let cb: TimerCallback<Exchange> = Rc::new(on_retry);
            el.create_timer(ex.retry_ms, cb);
        } else {
            ex.reply = Some(Err(TurfError::TryAgain(format!(
                "still running after {} retries",
                ex.retries
            ))));
        }
        return;
    }
    ex.reply = Some(Ok(Reply {
        code,
        retries: ex.retries,
    }));
}

fn on_retry(el: &mut EventLoop<Exchange>, ex: &mut Exchange, _id: TimerId) -> i64 {
    if let Err(e) = connect(el, ex) {
        ex.reply = Some(Err(e));
    }
    -1
}

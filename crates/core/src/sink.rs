//! Output sinks: where ordered log messages and rollout narration end up.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::LogMessage;

/// Final consumer of the ordered log stream.
pub trait LogEmitter: Send + Sync {
    fn emit(&self, msg: &LogMessage);
}

impl<F> LogEmitter for F
where
    F: Fn(&LogMessage) + Send + Sync,
{
    fn emit(&self, msg: &LogMessage) {
        self(msg)
    }
}

/// Colour scheme for the `[pod/container]` prefix.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrefixTheme {
    #[default]
    Bright,
    Basic,
    Gray,
    None,
}

fn hash_idx(name: &str, len: usize) -> usize {
    let mut h: u32 = 2166136261;
    for b in name.as_bytes() {
        h = h.wrapping_mul(16777619) ^ (*b as u32);
    }
    (h as usize) % len.max(1)
}

impl PrefixTheme {
    /// ANSI colour for a stream; stable for a given name.
    pub fn color_code_for(self, name: &str) -> Option<i32> {
        match self {
            PrefixTheme::Bright => {
                let codes: [i32; 7] = [91, 92, 93, 94, 95, 96, 97];
                Some(codes[hash_idx(name, codes.len())])
            }
            PrefixTheme::Basic => {
                let codes: [i32; 7] = [31, 32, 33, 34, 35, 36, 37];
                Some(codes[hash_idx(name, codes.len())])
            }
            PrefixTheme::Gray => Some(90),
            PrefixTheme::None => None,
        }
    }

    pub fn prefix(self, stream: &str) -> String {
        match self.color_code_for(stream) {
            Some(code) => format!("\x1b[{}m[{}]\x1b[0m ", code, stream),
            None => format!("[{}] ", stream),
        }
    }
}

/// Writes one line per message, either prefixed text or JSON.
pub struct WriterEmitter<W: Write + Send> {
    out: Mutex<W>,
    theme: PrefixTheme,
    json: bool,
}

impl<W: Write + Send> WriterEmitter<W> {
    pub fn new(out: W, theme: PrefixTheme) -> Self {
        Self { out: Mutex::new(out), theme, json: false }
    }

    pub fn json(out: W) -> Self {
        Self { out: Mutex::new(out), theme: PrefixTheme::None, json: true }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn render(&self, msg: &LogMessage) -> String {
        if self.json {
            serde_json::to_string(msg).unwrap_or_else(|_| msg.message.clone())
        } else {
            format!("{}{}", self.theme.prefix(&msg.stream), msg.message)
        }
    }
}

impl<W: Write + Send> LogEmitter for WriterEmitter<W> {
    fn emit(&self, msg: &LogMessage) {
        let line = self.render(msg);
        let mut out = match self.out.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(out, "{}", line) {
            warn!(error = %e, stream = %msg.stream, "log sink write failed");
        }
    }
}

/// Receives human-readable progress narration from deploy watchers.
pub trait Progress: Send + Sync {
    fn step(&self, line: &str);
}

/// Narrates through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl Progress for TracingProgress {
    fn step(&self, line: &str) {
        info!(target: "rollwatch::progress", "{}", line);
    }
}

pub struct WriterProgress<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> WriterProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> Progress for WriterProgress<W> {
    fn step(&self, line: &str) {
        let mut out = match self.out.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(out, "{}", line);
    }
}

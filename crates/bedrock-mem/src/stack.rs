//! Call stack capture for allocation records.
//!
//! Stacks are captured as raw instruction pointers into a fixed-size,
//! `Copy` buffer so that a record can live in arena storage without owning
//! heap memory. Symbolication only happens when a diagnostic is rendered.
//!
//! Capture is backed by the `backtrace` crate behind the `stack-capture`
//! feature; without it every stack is empty.

use std::fmt::{self, Write as _};

/// Maximum number of frames kept per stack.
pub const MAX_FRAMES: usize = 32;

/// A captured call stack.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackTrace {
    frames: [usize; MAX_FRAMES],
    len: usize,
}

impl StackTrace {
    /// A stack with no frames.
    pub const EMPTY: StackTrace = StackTrace {
        frames: [0; MAX_FRAMES],
        len: 0,
    };

    /// Captures the current stack, dropping the innermost `skip` frames and
    /// keeping at most `max_frames` (clamped to [`MAX_FRAMES`]).
    #[inline(never)]
    #[must_use]
    pub fn capture(skip: usize, max_frames: usize) -> Self {
        let mut trace = Self::EMPTY;
        let limit = max_frames.min(MAX_FRAMES);
        // +1 hides this function itself.
        trace.len = collect_stack_trace(&mut trace.frames[..limit], skip + 1);
        trace
    }

    /// Captured instruction pointers, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    /// Returns true if no frames were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Symbolicates the stack into one line per frame.
    #[must_use]
    pub fn render(&self) -> String {
        render_stack_trace(self.frames())
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| format!("{ip:#x}")))
            .finish()
    }
}

/// Fills `buffer` with return addresses of the current call stack.
///
/// The innermost `skip` frames (not counting this function) are dropped.
/// Returns the number of frames written.
#[cfg(feature = "stack-capture")]
#[inline(never)]
pub fn collect_stack_trace(buffer: &mut [usize], skip: usize) -> usize {
    let mut to_skip = skip + 1;
    let mut count = 0;
    backtrace::trace(|frame| {
        if count == buffer.len() {
            return false;
        }
        if to_skip > 0 {
            to_skip -= 1;
            return true;
        }
        buffer[count] = frame.ip() as usize;
        count += 1;
        true
    });
    count
}

/// Stack capture is compiled out; always returns 0.
#[cfg(not(feature = "stack-capture"))]
pub fn collect_stack_trace(_buffer: &mut [usize], _skip: usize) -> usize {
    0
}

/// Renders frames as `#index address symbol (file:line)` lines.
#[cfg(feature = "stack-capture")]
#[must_use]
pub fn render_stack_trace(frames: &[usize]) -> String {
    if frames.is_empty() {
        return String::from("    <no frames captured>");
    }

    let mut out = String::new();
    for (index, &ip) in frames.iter().enumerate() {
        let mut resolved = false;
        backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
            if resolved {
                return;
            }
            resolved = true;
            let name = symbol
                .name()
                .map_or_else(|| String::from("<unknown>"), |n| n.to_string());
            let _ = write!(out, "    #{index:<2} {ip:#018x} {name}");
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                let _ = write!(out, " ({}:{line})", file.display());
            }
            out.push('\n');
        });
        if !resolved {
            let _ = writeln!(out, "    #{index:<2} {ip:#018x} <unresolved>");
        }
    }
    out.pop();
    out
}

/// Renders raw addresses; symbols need the `stack-capture` feature.
#[cfg(not(feature = "stack-capture"))]
#[must_use]
pub fn render_stack_trace(frames: &[usize]) -> String {
    if frames.is_empty() {
        return String::from("    <stack capture disabled>");
    }
    frames
        .iter()
        .enumerate()
        .map(|(index, ip)| format!("    #{index:<2} {ip:#018x}"))
        .collect::<Vec<_>>()
        .join("\n")
}

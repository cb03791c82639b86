//! Errors carrying the call stack of their creation point
//!
//! Errors in Rust do not record where they were created. [`TracedError`]
//! wraps any error and captures the stack when it is constructed, so an
//! escalated log record can point at the code that produced the failure
//! rather than at the logging call.

use backtrace::Backtrace;
use mesh_telemetry::report::StackFrame;
use std::error::Error;
use std::fmt;

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Function-path prefixes of frames that belong to capture and logging
/// machinery.
const INTERNAL_PREFIXES: &[&str] = &[
    "alloc::",
    "backtrace::",
    "core::",
    "mesh_log::",
    "std::",
    "tracing::",
    "tracing_core::",
    "tracing_subscriber::",
];

/// Error wrapper with a captured call stack.
///
/// Displays as the wrapped error and exposes the wrapped error's source.
pub struct TracedError {
    inner: BoxError,
    type_name: &'static str,
    frames: Vec<StackFrame>,
}

impl TracedError {
    /// Wrap `error`, capturing the current call stack.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
            type_name: std::any::type_name::<E>(),
            frames: capture_frames(),
        }
    }

    /// Error from a plain message, capturing the current call stack.
    pub fn msg(message: impl Into<String>) -> Self {
        let inner: BoxError = message.into().into();
        Self {
            inner,
            type_name: "Error",
            frames: capture_frames(),
        }
    }

    /// Wrapped error
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Type name of the wrapped error
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Captured frames, caller first
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

impl fmt::Display for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedError")
            .field("inner", &self.inner)
            .field("type_name", &self.type_name)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl Error for TracedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

/// Attach a captured stack to the error of a `Result`.
pub trait Traced<T> {
    fn traced(self) -> Result<T, TracedError>;
}

impl<T, E> Traced<T> for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    #[inline(never)]
    fn traced(self) -> Result<T, TracedError> {
        self.map_err(TracedError::new)
    }
}

/// Stack of the current call site, caller first, with capture and logging
/// frames removed.
#[inline(never)]
pub fn capture_frames() -> Vec<StackFrame> {
    let backtrace = Backtrace::new();
    let frames = backtrace
        .frames()
        .iter()
        .flat_map(|frame| frame.symbols())
        .map(|symbol| {
            let function = symbol.name().map(|name| format!("{name:#}"));
            StackFrame {
                module: function.as_deref().and_then(module_of),
                function,
                filename: symbol.filename().map(|p| p.display().to_string()),
                lineno: symbol.lineno(),
            }
        })
        .collect();

    strip_logging_frames(frames)
}

fn module_of(function: &str) -> Option<String> {
    let path = function.trim_start_matches('<');
    path.rsplit_once("::").map(|(module, _)| module.to_string())
}

fn is_internal(frame: &StackFrame) -> bool {
    frame
        .function
        .as_deref()
        .map(|f| f.trim_start_matches('<'))
        .is_some_and(|f| INTERNAL_PREFIXES.iter().any(|p| f.starts_with(p)))
}

/// Drop the innermost run of capture and logging frames, then order the
/// remainder caller first.
///
/// `frames` must be innermost first, as produced by a stack walk.
pub fn strip_logging_frames(frames: Vec<StackFrame>) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = frames
        .into_iter()
        .skip_while(|frame| frame.function.is_none() || is_internal(frame))
        .collect();
    frames.reverse();
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str) -> StackFrame {
        StackFrame {
            function: Some(function.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_strip_logging_frames() {
        let frames = vec![
            frame("backtrace::backtrace::trace"),
            frame("backtrace::capture::Backtrace::new"),
            frame("mesh_log::traced::capture_frames"),
            frame("<mesh_log::layer::LogLayer as tracing_subscriber::layer::Layer<S>>::on_event"),
            frame("orders::checkout::charge"),
            frame("orders::main"),
        ];

        let stripped = strip_logging_frames(frames);
        let names: Vec<_> = stripped.iter().filter_map(|f| f.function.as_deref()).collect();

        assert_eq!(names, vec!["orders::main", "orders::checkout::charge"]);
    }

    #[test]
    fn test_strip_keeps_internal_frames_below_caller() {
        let frames = vec![
            frame("mesh_log::traced::capture_frames"),
            frame("orders::handler"),
            frame("tracing::span::Span::in_scope"),
            frame("orders::main"),
        ];

        let stripped = strip_logging_frames(frames);
        assert_eq!(stripped.len(), 3);
        assert_eq!(stripped[2].function.as_deref(), Some("orders::handler"));
    }

    #[test]
    fn test_module_of() {
        assert_eq!(module_of("orders::checkout::charge").as_deref(), Some("orders::checkout"));
        assert_eq!(module_of("main"), None);
    }

    #[test]
    fn test_traced_error_wraps() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        let err = TracedError::new(io);

        assert_eq!(err.to_string(), "config missing");
        assert!(err.type_name().ends_with("Error"));
        assert!(
            err.frames()
                .iter()
                .all(|f| !f.function.as_deref().unwrap_or("").starts_with("backtrace::"))
        );
    }

    #[test]
    fn test_traced_result() {
        let result: Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let err = result.traced().unwrap_err();

        assert!(err.type_name().contains("fmt"));
    }
}

//! Internal helper macros.

/// Constructs an [`Error::MalformedLayout`](crate::Error::MalformedLayout) with
/// source-location context, from either a plain message or a format string.
macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        $crate::Error::MalformedLayout {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::MalformedLayout {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

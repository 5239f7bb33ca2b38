//! HTTP probe: transport, request encoding, response validation and jobs.

pub mod check;
pub mod condition;
pub mod encoder;
pub mod expr;
pub mod job;
pub mod result;
pub mod transport;

use std::fmt::Write;

/// Render an error and its chain of causes on one line. Causes already
/// spelled out by an outer message are not repeated.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let cause = src.to_string();
        if !s.contains(&cause) {
            let _ = write!(s, ": {}", cause);
        }
        err = src;
    }
    s
}

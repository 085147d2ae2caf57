//! Serial link to a differential-drive robot: peer selection, a single
//! connect attempt at a time, and a line-oriented drive command protocol.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

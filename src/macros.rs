#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! susi_log {
    (trace, $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug, $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,  $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,  $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error, $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! susi_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! susi_trace {
    ($($arg:expr),*) => (susi_log!(trace, $($arg),*));
}

macro_rules! susi_debug {
    ($($arg:expr),*) => (susi_log!(debug, $($arg),*));
}

macro_rules! susi_info {
    ($($arg:expr),*) => (susi_log!(info, $($arg),*));
}

macro_rules! susi_warn {
    ($($arg:expr),*) => (susi_log!(warn, $($arg),*));
}

macro_rules! susi_error {
    ($($arg:expr),*) => (susi_log!(error, $($arg),*));
}

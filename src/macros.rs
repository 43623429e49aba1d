// Trace raw bus traffic; compiled out unless `debug_packets` is enabled
macro_rules! busdbg {
    ($($arg:tt)*) => {
        if cfg!(feature = "debug_packets") {
            log::trace!($($arg)*);
        }
    };
}

// SCHEDGOV STRUCTURED LOGGING
// TIMESTAMPED [HH:MM:SS] [LEVEL] FORMAT, SHARED BY LIBRARY AND BINARY

pub fn _timestamp() -> String {
    unsafe {
        let mut t: libc::time_t = 0;
        libc::time(&mut t);
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&t, &mut tm);
        format!("[{:02}:{:02}:{:02}]", tm.tm_hour, tm.tm_min, tm.tm_sec)
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        println!("{} [INFO]   {}", $crate::log::_timestamp(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        println!("{} [WARN]   {}", $crate::log::_timestamp(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("{} [ERROR]  {}", $crate::log::_timestamp(), format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn timestamp_shape() {
        let ts = super::_timestamp();
        assert_eq!(ts.len(), 10);
        assert!(ts.starts_with('['));
        assert!(ts.ends_with(']'));
        assert_eq!(&ts[3..4], ":");
        assert_eq!(&ts[6..7], ":");
    }
}

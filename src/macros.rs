macro_rules! s {
    ($e:expr) => {
        $e.to_string()
    };
}

macro_rules! log_activity {
    ($($arg:tt)*) => {
        crate::logging::write(crate::logging::LogType::Activity, &format!($($arg)*))
    };
}

macro_rules! log_error {
    ($($arg:tt)*) => {
        crate::logging::write(crate::logging::LogType::Error, &format!($($arg)*))
    };
}

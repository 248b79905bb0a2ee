//! Helper macros for logging (console printing).

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_trace!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_debug!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_info!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_warn!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_error!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `MirrorlogError`
/// containing the string.
///
/// Example:
/// ```ignore
/// let e = logged_err!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {
        {
            pf_error!($prefix; $fmt_str);
            Err(MirrorlogError(format!(concat!("({}) ", $fmt_str), $prefix)))
        }
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($prefix; $fmt_str, $($fmt_arg)*);
            Err(MirrorlogError(
                format!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*),
            ))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use crate::utils::MirrorlogError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!(0; "interesting message"),
            Err::<(), MirrorlogError>(MirrorlogError(
                "(0) interesting message".into()
            ))
        );
        assert_eq!(
            logged_err!("backup"; "interesting message"),
            Err::<(), MirrorlogError>(MirrorlogError(
                "(backup) interesting message".into()
            ))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!(7; "got {} to print", 777),
            Err::<(), MirrorlogError>(MirrorlogError(
                "(7) got 777 to print".into()
            ))
        );
    }
}

//! Helper macros for logging (console printing).

/// Log TRACE message with parenthesized node prefix.
///
/// Example:
/// ```no_run
/// # let id = 0;
/// # let msg = "x";
/// colonnade::pf_trace!(id; "got {} to print", msg);
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

/// Log DEBUG message with parenthesized node prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized node prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized node prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized node prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `CoordError::Internal`
/// containing the same string.
///
/// Example:
/// ```no_run
/// # let id = 0;
/// # let msg = "x";
/// # fn example(id: i32, msg: &str) -> Result<(), colonnade::CoordError> {
/// let e = colonnade::logged_err!(id; "got {} to print", msg);
/// # e
/// # }
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {{
        $crate::pf_error!($prefix; $fmt_str);
        Err($crate::CoordError::Internal(format!(
            concat!("({}) ", $fmt_str),
            $prefix
        )))
    }};

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {{
        $crate::pf_error!($prefix; $fmt_str, $($fmt_arg)*);
        Err($crate::CoordError::Internal(format!(
            concat!("({}) ", $fmt_str),
            $prefix, $($fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::CoordError;

    #[test]
    fn error_no_args() {
        let e: Result<(), CoordError> = logged_err!(0; "interesting message");
        assert_eq!(
            e,
            Err(CoordError::Internal("(0) interesting message".into()))
        );
    }

    #[test]
    fn error_with_args() {
        let e: Result<(), CoordError> = logged_err!(0; "got {} to print", 777);
        assert_eq!(e, Err(CoordError::Internal("(0) got 777 to print".into())));
    }
}

#![allow(unused_macros)]

/// Aborts on a broken IR invariant.
///
/// Invariant violations are bugs in a pass, not data errors, so they never travel through
/// [`crate::Result`]. The message carries the source location that detected the violation.
///
/// ```rust, ignore
///  invariant!(block.items.len() > idx, "position {} out of range", idx);
/// ```
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!(
                "invariant violated at {}:{}: {}",
                file!(),
                line!(),
                format_args!($($arg)+)
            );
        }
    };
}

/// Unconditional form of [`invariant!`].
///
/// ```rust, ignore
///  let Some(pseudo) = next else { invariant_failed!("orphaned pseudo") };
/// ```
macro_rules! invariant_failed {
    ($($arg:tt)+) => {
        panic!(
            "invariant violated at {}:{}: {}",
            file!(),
            line!(),
            format_args!($($arg)+)
        )
    };
}

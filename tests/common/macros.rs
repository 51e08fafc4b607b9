/// Unwraps an `Ok`, panicking with the error's debug form otherwise.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!("expected Ok(_), got Err({:?})", err),
        }
    };
}

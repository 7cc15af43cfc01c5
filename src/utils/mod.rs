pub mod clock;
pub mod digest;
#[cfg(test)]
pub(crate) mod mock_http;
pub mod retry;

// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod durable;
pub mod fetch;
pub mod refresh;
pub mod utils;

pub use utils::*;

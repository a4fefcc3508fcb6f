pub mod clock;
pub mod defer;

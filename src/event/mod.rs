pub mod fields;
pub mod timer;

pub use fields::Fields;
pub use timer::Timer;

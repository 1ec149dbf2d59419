pub mod id;
pub mod rand;

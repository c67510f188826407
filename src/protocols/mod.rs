pub mod apl;
pub mod lpl;

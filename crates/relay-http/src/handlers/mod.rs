pub mod pages;
pub mod send;
pub mod status;

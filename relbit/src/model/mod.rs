pub mod entity;
pub mod inheritance;
pub mod naming;
pub mod pivot;
pub mod registry;

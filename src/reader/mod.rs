pub mod chapter;
pub mod loader;
pub mod menu;
pub mod model;
pub mod pager;
pub mod scope;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

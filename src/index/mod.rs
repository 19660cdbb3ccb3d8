pub(crate) mod llrb;
pub(crate) mod splay;

pub(crate) use llrb::Llrb;
pub(crate) use splay::{SplayIdx, SplayTree};

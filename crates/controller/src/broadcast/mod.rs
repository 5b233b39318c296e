//! Broadcast scheduler: a binary tree of nodes fanning requests out to
//! engines and collecting their replies.

pub mod node;
pub mod runner;
pub mod tree;

pub use node::{BroadcastAction, BroadcastNode};
pub use runner::{BroadcastSockets, BroadcastUnit};
pub use tree::{BroadcastTree, TreeNode};

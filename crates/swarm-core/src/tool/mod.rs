//! Tool system
//!
//! Tools are registered once in a shared [`ToolManager`]; each task gets an
//! immutable [`ToolView`] restricted to the names its policy allows.

pub mod manager;
pub mod traits;
pub mod view;

pub use manager::ToolManager;
pub use traits::{Tool, ToolResult};
pub use view::ToolView;

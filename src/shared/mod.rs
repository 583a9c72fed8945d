pub mod workspace_id;

pub use workspace_id::{sanitize_entity_id, tab_dir};

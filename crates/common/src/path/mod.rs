mod normalize;

pub use normalize::{normalize_folder, normalize_path, scope_contains, PathError};

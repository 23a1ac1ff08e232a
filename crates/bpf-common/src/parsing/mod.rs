pub mod containers;
pub mod mountinfo;
pub mod procfs;

mod string_array;
mod string_list;

pub use string_array::StringArray;
pub use string_list::{StringListError, decode_string_list, encode_string_list};

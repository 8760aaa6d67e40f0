// System call interface for the filesystem core

pub mod fs;
pub mod uaccess;

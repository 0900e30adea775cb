mod resource;
mod spec;

pub use resource::Buffer;
pub use spec::{BufferSpec, BufferUsage};

mod resource;
mod spec;

pub use resource::Image;
pub use spec::ImageSpec;

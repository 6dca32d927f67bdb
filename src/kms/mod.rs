pub mod alloc;
pub mod device;
pub mod mmap;
pub mod modeset;
pub mod pixel_format;
pub mod probe;
pub mod resources;
pub mod scan;
pub mod seat;
pub mod session;

#[cfg(test)]
pub mod fake;

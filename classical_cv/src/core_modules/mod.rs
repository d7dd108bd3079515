// THEORY:
// The building blocks behind the dispatcher, leaves first: the image and parameter
// models, the Image Library boundary and its backends, overlay drawing, the catalog
// descriptors, the per-category operations and the registry that binds them.

pub mod annotate;
pub mod descriptor;
pub mod frame;
pub mod library;
pub mod operations;
pub mod params;
pub mod registry;

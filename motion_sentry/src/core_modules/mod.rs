pub mod background_model;
pub mod blob;
pub mod blob_detector;
pub mod encoder;
pub mod event_machine;
pub mod frame;
pub mod frame_source;
pub mod hooks;
pub mod motion_detector;
pub mod picture;
pub mod precapture;
pub mod recording;

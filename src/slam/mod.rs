pub mod calib;
pub mod camera;
pub mod frame;
pub mod load_data;
pub mod loop_closing;
pub mod map;
pub mod photometric;
pub mod process_image;
pub mod system;
pub mod undistort;
pub mod vocabulary;

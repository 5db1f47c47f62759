pub mod afterimage;
pub mod channel_model;
pub mod excitation;
pub mod kinetics;
pub mod retina;
pub mod sequence;
pub mod single_frame;
pub mod tensor;
pub mod utils;

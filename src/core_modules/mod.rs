pub mod background;
pub mod binarizer;
pub mod contour;
pub mod contour_detector;
pub mod frame;
pub mod particle;
pub mod preprocessing;
pub mod track;
pub mod tracker;

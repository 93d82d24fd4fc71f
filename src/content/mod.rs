//! Content data model: topics, slide/quiz documents, fragments and the
//! boundary validation applied to them.

pub mod fragment;
pub mod model;
pub mod validate;

pub use fragment::split_theory;
pub use model::{
    ContentBody, ContentUnit, Fragment, QuizContent, SlideContent, SlideStatus, Topic,
    check_layout,
};

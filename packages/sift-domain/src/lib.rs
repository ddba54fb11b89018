pub mod normalize;
pub mod snippet;
pub mod tokens;

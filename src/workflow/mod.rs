//! Workflow-file understanding: matrix expansion into explicit jobs, the
//! expression context tree, and the `${{ … }}` expression engine.

pub mod context;
pub mod expressions;
pub mod matrix;

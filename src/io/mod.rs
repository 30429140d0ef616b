/*!
Helper functions for saving chains and covariance matrices to disk.
*/

#[cfg(feature = "csv")]
pub mod csv;

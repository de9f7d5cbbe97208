pub mod conv;
pub mod drop_path;
pub mod fusion;
pub mod init;
pub mod load;
pub mod mixer;
pub mod model;
pub mod norm;
pub mod rope;
pub mod ssm;
pub mod transform;

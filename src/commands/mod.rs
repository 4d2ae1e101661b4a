pub mod init_config;
pub mod run;

pub use init_config::handle_init_config;
pub use run::handle_run;

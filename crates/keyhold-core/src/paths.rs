use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::Error;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "keyhold";
pub const APP_NAME: &str = "keyhold";

pub const DATABASE_FILE: &str = "identity.db";
pub const CONFIG_FILE: &str = "config.json";

fn project_dirs() -> Result<ProjectDirs, Error> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| Error::Config("cannot determine home directory".into()))
}

pub fn data_dir() -> Result<PathBuf, Error> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn config_dir() -> Result<PathBuf, Error> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn default_database_path() -> Result<PathBuf, Error> {
    Ok(data_dir()?.join(DATABASE_FILE))
}

pub fn default_config_path() -> Result<PathBuf, Error> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Poisoned,
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Database(_) => "database".into(),
            Error::Io(_) => "io".into(),
            Error::Poisoned => "poisoned".into(),
        }
    }
}

use magnus::Error;

use crate::errors::LoadError;

pub fn wrap_load_err(err: LoadError) -> Error {
    Error::new(magnus::exception::runtime_error(), err.to_string())
}

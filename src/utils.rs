pub mod hashing;

use serde_json::{Map, Value};

pub type JsonMap = Map<String, Value>;

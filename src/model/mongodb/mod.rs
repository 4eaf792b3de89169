mod collection;
mod counter;

pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use counter::{ensure_option_id_counter_exists, Counter, OPTION_ID_COUNTER_ID};

pub mod datatypes;
pub mod encoder;
pub mod params;
pub mod row_encoder;

pub use datatypes::{
    columns_to_fields, decl_type_to_pg, resolve_column_type, value_to_pg, ColumnDef,
};
pub use encoder::encode_value;
pub use params::decode_parameters;
pub use row_encoder::RowEncoder;

pub mod conv;
pub mod tensor_ext;

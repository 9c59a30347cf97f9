// Mappers module - Protocol converters

pub mod openai;

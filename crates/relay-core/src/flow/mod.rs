//! Flow - the reader → transformer → writer pipeline run for every message.

pub mod builder;
pub mod provider;
pub mod spec;

pub use self::builder::{
    ConfigurationStep, FlowBuilder, ProcessorStep, ReaderStep, TransformerStep, WriterStep,
};
pub use self::provider::Provider;
pub use self::spec::{FlowInfo, FlowSpec, FlowStatus, ReaderFn, TransformerFn, WriterFn};

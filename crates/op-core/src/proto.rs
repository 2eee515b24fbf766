//! Generated protobuf types for the `op.v1` service contract.

/// The `op.v1` package.
#[allow(clippy::doc_markdown, clippy::must_use_candidate, missing_docs)]
pub mod op {
    pub mod v1 {
        tonic::include_proto!("op.v1");

        /// Encoded `FileDescriptorSet` for the `op.v1` package, registered
        /// with the reflection service so dynamic clients can discover us.
        pub const FILE_DESCRIPTOR_SET: &[u8] =
            tonic::include_file_descriptor_set!("op_descriptor");
    }
}

//! Shader binding tables
//!
//! Each record is `[identifier][local arguments][padding]`, repeated at a
//! fixed stride in host-visible memory. The table is written once at
//! creation and only read by the GPU afterwards.

use crate::foundation::align::{is_aligned, round_up};
use crate::gpu::allocator::GpuAllocator;
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::handles::GpuBuffer;
use crate::gpu::types::{BufferUsage, DeviceAddress, GpuAddressRange, GpuAddressRangeAndStride};

/// One record to place in a [`ShaderTable`]
#[derive(Debug, Clone, Copy)]
pub struct ShaderRecord<'a> {
    /// Opaque shader group identifier from the pipeline
    pub identifier: &'a [u8],
    /// Root/local arguments, truncated or zero-padded to the table's argument size
    pub local_arguments: Option<&'a [u8]>,
}

impl<'a> ShaderRecord<'a> {
    /// Record without local arguments
    pub fn new(identifier: &'a [u8]) -> Self {
        Self {
            identifier,
            local_arguments: None,
        }
    }

    /// Attach local arguments
    pub fn with_local_arguments(mut self, arguments: &'a [u8]) -> Self {
        self.local_arguments = Some(arguments);
        self
    }
}

/// Packed shader records in one GPU-visible buffer
pub struct ShaderTable {
    buffer: GpuBuffer,
    offset: u64,
    stride: u64,
    record_count: u32,
}

impl ShaderTable {
    /// Record stride for the device's identifier size and record alignment
    pub fn stride_for(identifier_size: u32, local_argument_size: u32, record_alignment: u32) -> u64 {
        round_up(
            u64::from(identifier_size) + u64::from(local_argument_size),
            u64::from(record_alignment),
        )
    }

    /// Allocate and fill a table with `records`
    pub fn new(allocator: &GpuAllocator, records: &[ShaderRecord<'_>], local_argument_size: u32) -> GpuResult<Self> {
        if records.is_empty() {
            return Err(GpuError::EmptyShaderTable);
        }

        let caps = allocator.capabilities();
        let identifier_size = caps.shader_identifier_size;
        if let Some(short) = records
            .iter()
            .find(|record| record.identifier.len() < identifier_size as usize)
        {
            return Err(GpuError::InvalidShaderIdentifier {
                expected: identifier_size,
                actual: short.identifier.len(),
            });
        }

        let stride = Self::stride_for(identifier_size, local_argument_size, caps.shader_record_alignment);
        let table_alignment = u64::from(caps.shader_table_alignment);
        let table_size = stride * records.len() as u64;

        let buffer = allocator.create_upload_buffer(
            table_size + table_alignment - 1,
            BufferUsage::SHADER_TABLE,
            "shader table",
        )?;
        let offset = round_up(buffer.address(), table_alignment) - buffer.address();
        debug_assert!(is_aligned(buffer.address() + offset, table_alignment));

        {
            let mut mapped = buffer.map()?;
            let table = &mut mapped.as_mut_slice()[offset as usize..(offset + table_size) as usize];
            let id_len = identifier_size as usize;
            let arg_len = local_argument_size as usize;

            for (record, slot) in records.iter().zip(table.chunks_exact_mut(stride as usize)) {
                slot[..id_len].copy_from_slice(&record.identifier[..id_len]);
                if arg_len == 0 {
                    slot[id_len..].fill(0);
                    continue;
                }
                let arguments = &mut slot[id_len..id_len + arg_len];
                let supplied = record.local_arguments.unwrap_or(&[]);
                let copied = supplied.len().min(arg_len);
                arguments[..copied].copy_from_slice(&supplied[..copied]);
                arguments[copied..].fill(0);
                slot[id_len + arg_len..].fill(0);
            }
        }

        log::debug!(
            "Created shader table: {} records, stride {}, {} bytes",
            records.len(),
            stride,
            table_size
        );

        Ok(Self {
            buffer,
            offset,
            stride,
            record_count: records.len() as u32,
        })
    }

    /// Start of the first record
    pub fn address(&self) -> DeviceAddress {
        self.buffer.address() + self.offset
    }

    /// Distance between records
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of records
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Total size of all records
    pub fn size(&self) -> u64 {
        self.stride * u64::from(self.record_count)
    }

    /// Address range, for a single-record binding such as ray generation
    pub fn record_view(&self) -> GpuAddressRange {
        GpuAddressRange {
            address: self.address(),
            size: self.size(),
        }
    }

    /// Address range with stride, for miss and hit group bindings
    pub fn table_view(&self) -> GpuAddressRangeAndStride {
        GpuAddressRangeAndStride {
            address: self.address(),
            size: self.size(),
            stride: self.stride,
        }
    }

    /// Backing buffer
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Byte offset of the first record within [`Self::buffer`]
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn identifier(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn test_three_records_without_arguments() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let ids = [identifier(1), identifier(2), identifier(3)];
        let records: Vec<_> = ids.iter().map(|id| ShaderRecord::new(id)).collect();

        let table = ShaderTable::new(&allocator, &records, 0).unwrap();
        assert_eq!(table.stride(), 32);
        assert_eq!(table.size(), 96);
        assert_eq!(table.record_view().size, 96);

        let view = table.table_view();
        assert_eq!(view.stride, 32);
        assert_eq!(view.address % 64, 0);

        let bytes = device.read_buffer(table.buffer());
        let start = table.offset() as usize;
        assert_eq!(&bytes[start..start + 32], &ids[0]);
        assert_eq!(&bytes[start + 64..start + 96], &ids[2]);
    }

    #[test]
    fn test_stride_properties() {
        for argument_size in [0u32, 32, 64] {
            for alignment in [1u32, 8, 32, 64] {
                let stride = ShaderTable::stride_for(32, argument_size, alignment);
                assert_eq!(stride % u64::from(alignment), 0);
                assert!(stride >= u64::from(32 + argument_size));
                assert!(stride < u64::from(32 + argument_size + alignment));
            }
        }
    }

    #[test]
    fn test_arguments_are_truncated_and_padded() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let id = identifier(7);
        let long_args = [0xAAu8; 40];
        let short_args = [0xBBu8; 4];
        let records = [
            ShaderRecord::new(&id).with_local_arguments(&long_args),
            ShaderRecord::new(&id).with_local_arguments(&short_args),
            ShaderRecord::new(&id),
        ];

        let table = ShaderTable::new(&allocator, &records, 16).unwrap();
        assert_eq!(table.stride(), 64);

        let bytes = device.read_buffer(table.buffer());
        let base = table.offset() as usize;
        let first = &bytes[base..base + 64];
        assert_eq!(&first[32..48], &[0xAA; 16]);
        assert!(first[48..].iter().all(|&b| b == 0));

        let second = &bytes[base + 64..base + 128];
        assert_eq!(&second[32..36], &short_args);
        assert!(second[36..].iter().all(|&b| b == 0));

        let third = &bytes[base + 128..base + 192];
        assert_eq!(&third[..32], &id);
        assert!(third[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_longer_identifiers_are_cut_to_driver_size() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let long_id = [9u8; 48];
        let table = ShaderTable::new(&allocator, &[ShaderRecord::new(&long_id)], 0).unwrap();
        assert_eq!(table.stride(), 32);
        let bytes = device.read_buffer(table.buffer());
        let base = table.offset() as usize;
        assert_eq!(&bytes[base..base + 32], &[9u8; 32]);
    }

    #[test]
    fn test_rejects_empty_and_short_identifiers() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());

        assert!(matches!(
            ShaderTable::new(&allocator, &[], 0),
            Err(GpuError::EmptyShaderTable)
        ));

        let short = [0u8; 16];
        assert!(matches!(
            ShaderTable::new(&allocator, &[ShaderRecord::new(&short)], 0),
            Err(GpuError::InvalidShaderIdentifier { expected: 32, actual: 16 })
        ));
        assert_eq!(device.live_buffers(), 0);
    }
}

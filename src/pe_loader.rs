use crate::evidence::{
    Export, GuardFunction, Import, LoadConfig, ModuleEvidence, RuntimeFunction, ScopeRecord,
    Symbol,
};
use crate::image::{Image, Section, SectionFlags};
use anyhow::{Context, Result, bail};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use object::LittleEndian as LE;
use object::pe::{
    IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT, IMAGE_DIRECTORY_ENTRY_EXCEPTION,
    IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG,
    ImageNtHeaders64,
};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

const UNW_FLAG_EHANDLER: u8 = 0x1;
const UNW_FLAG_UHANDLER: u8 = 0x2;
const UNW_FLAG_CHAININFO: u8 = 0x4;
const RUNTIME_FUNCTION_SIZE: u64 = 12;
const MAX_CHAIN_DEPTH: usize = 32;

/// `IMAGE_LOAD_CONFIG_DIRECTORY64` field offsets.
mod load_config {
    pub const SECURITY_COOKIE: u64 = 88;
    pub const GUARD_CF_CHECK_FUNCTION_POINTER: u64 = 112;
    pub const GUARD_CF_DISPATCH_FUNCTION_POINTER: u64 = 120;
    pub const GUARD_CF_FUNCTION_TABLE: u64 = 128;
    pub const GUARD_CF_FUNCTION_COUNT: u64 = 136;
    pub const GUARD_FLAGS: u64 = 144;
    pub const GUARD_EH_CONTINUATION_TABLE: u64 = 264;
    pub const GUARD_EH_CONTINUATION_COUNT: u64 = 272;
    pub const GUARD_XFG_CHECK_FUNCTION_POINTER: u64 = 280;
    pub const GUARD_XFG_DISPATCH_FUNCTION_POINTER: u64 = 288;
    pub const GUARD_XFG_TABLE_DISPATCH_FUNCTION_POINTER: u64 = 296;
    pub const GUARD_MEMCPY_FUNCTION_POINTER: u64 = 312;

    pub const GUARD_CF_FUNCTION_TABLE_SIZE_MASK: u32 = 0xF000_0000;
    pub const GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT: u32 = 28;
}

/// A memory-mapped PE32+ file.
pub struct PeLoader {
    mmap: Mmap,
    pub image_base: u64,
}

impl PeLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };

        let pe_file = PeFile::<ImageNtHeaders64>::parse(&*mmap)
            .with_context(|| format!("{} is not a PE32+ image", path.display()))?;
        let image_base = pe_file.nt_headers().optional_header().image_base();

        Ok(Self { mmap, image_base })
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// Lay the file out at its virtual addresses.
    pub fn image(&self) -> Result<Image> {
        let pe_file = PeFile::<ImageNtHeaders64>::parse(&*self.mmap)?;
        let optional = pe_file.nt_headers().optional_header();
        let size_of_image = optional.size_of_image() as usize;
        let size_of_headers = optional.size_of_headers();

        let mut data = vec![0u8; size_of_image];
        let headers = (size_of_headers as usize).min(self.mmap.len()).min(size_of_image);
        data[..headers].copy_from_slice(&self.mmap[..headers]);

        let mut sections = Vec::new();
        for header in pe_file.section_table().iter() {
            let virtual_address = header.virtual_address.get(LE);
            let virtual_size = header.virtual_size.get(LE);
            let raw_size = header.size_of_raw_data.get(LE);
            let raw_offset = header.pointer_to_raw_data.get(LE) as usize;

            let start = virtual_address as usize;
            let mapped = if virtual_size == 0 { raw_size } else { raw_size.min(virtual_size) };
            let len = (mapped as usize)
                .min(self.mmap.len().saturating_sub(raw_offset))
                .min(size_of_image.saturating_sub(start));
            if len > 0 {
                data[start..start + len].copy_from_slice(&self.mmap[raw_offset..raw_offset + len]);
            }

            sections.push(Section {
                name: String::from_utf8_lossy(header.raw_name()).into_owned(),
                virtual_address,
                virtual_size: virtual_size.max(raw_size),
                flags: SectionFlags::from_bits_truncate(header.characteristics.get(LE)),
            });
        }

        debug!(
            target: "fnbound::pe",
            base = format!("0x{:x}", self.image_base),
            size = size_of_image,
            sections = sections.len(),
            "Mapped image"
        );
        Ok(Image::new(self.image_base, data, size_of_headers, sections))
    }

    /// Read every directory the analysis takes evidence from. `symbols` are
    /// used to recognize exception handlers and are stored in the result.
    pub fn evidence(&self, image: &Image, symbols: Vec<Symbol>) -> Result<ModuleEvidence> {
        let pe_file = PeFile::<ImageNtHeaders64>::parse(&*self.mmap)?;
        let directory = |index| {
            pe_file
                .data_directory(index)
                .map(|d| d.address_range())
                .filter(|&(address, size)| address != 0 && size != 0)
        };

        let reader = DirectoryReader { image };
        let exports = match directory(IMAGE_DIRECTORY_ENTRY_EXPORT) {
            Some(range) => reader.exports(range)?,
            None => Vec::new(),
        };
        let mut imports = match directory(IMAGE_DIRECTORY_ENTRY_IMPORT) {
            Some((address, _)) => reader.imports(address, false)?,
            None => Vec::new(),
        };
        if let Some((address, _)) = directory(IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT) {
            imports.extend(reader.imports(address, true)?);
        }

        let mut names: FxHashMap<u64, &str> = FxHashMap::default();
        for export in &exports {
            if let Some(name) = &export.name {
                names.insert(export.address, name);
            }
        }
        for symbol in &symbols {
            names.entry(symbol.address).or_insert(&symbol.name);
        }
        let import_names: FxHashMap<u64, &str> = imports
            .iter()
            .filter_map(|i| Some((i.address, i.name.as_deref()?)))
            .collect();
        let handlers = HandlerNames {
            image,
            names,
            import_names,
        };

        let runtime_functions = match directory(IMAGE_DIRECTORY_ENTRY_EXCEPTION) {
            Some((address, size)) => reader.runtime_functions(address, size, &handlers),
            None => Vec::new(),
        };
        let load_config = match directory(IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG) {
            Some((address, _)) => reader.load_config(address),
            None => None,
        };

        info!(
            target: "fnbound::pe",
            exports = exports.len(),
            imports = imports.len(),
            runtime_functions = runtime_functions.len(),
            load_config = load_config.is_some(),
            "Read directories"
        );

        Ok(ModuleEvidence {
            imports,
            exports,
            runtime_functions,
            load_config,
            symbols,
            pattern_matches: Vec::new(),
        })
    }
}

/// Reads data directories out of a mapped image.
struct DirectoryReader<'a> {
    image: &'a Image,
}

impl DirectoryReader<'_> {
    fn va(&self, rva: u32) -> u64 {
        self.image.base() + rva as u64
    }

    fn u16(&self, address: u64) -> Result<u16> {
        self.image
            .read(address, 2)
            .map(LittleEndian::read_u16)
            .with_context(|| format!("Read past end of image at 0x{:x}", address))
    }

    fn u32(&self, address: u64) -> Result<u32> {
        self.image
            .read_u32(address)
            .with_context(|| format!("Read past end of image at 0x{:x}", address))
    }

    fn u64(&self, address: u64) -> Result<u64> {
        self.image
            .read_u64(address)
            .with_context(|| format!("Read past end of image at 0x{:x}", address))
    }

    fn c_string(&self, address: u64) -> Result<String> {
        let bytes = self.image.bytes_from(address);
        let Some(len) = bytes.iter().position(|&b| b == 0) else {
            bail!("Unterminated string at 0x{:x}", address);
        };
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }

    fn exports(&self, (address, size): (u32, u32)) -> Result<Vec<Export>> {
        let directory = self.va(address);
        let directory_end = directory + size as u64;
        let ordinal_base = self.u32(directory + 16)?;
        let function_count = self.u32(directory + 20)?;
        let name_count = self.u32(directory + 24)?;
        let functions = self.va(self.u32(directory + 28)?);
        let name_table = self.va(self.u32(directory + 32)?);
        let ordinal_table = self.va(self.u32(directory + 36)?);

        let mut names: FxHashMap<u32, String> = FxHashMap::default();
        for i in 0..name_count as u64 {
            let name = self.c_string(self.va(self.u32(name_table + i * 4)?))?;
            let index = self.u16(ordinal_table + i * 2)? as u32;
            names.insert(index, name);
        }

        let mut exports = Vec::new();
        for index in 0..function_count {
            let rva = self.u32(functions + index as u64 * 4)?;
            if rva == 0 {
                continue;
            }
            let address = self.va(rva);
            let forwarder = if (directory..directory_end).contains(&address) {
                Some(self.c_string(address)?)
            } else {
                None
            };
            exports.push(Export {
                address,
                name: names.remove(&index),
                ordinal: ordinal_base + index,
                forwarder,
            });
        }
        exports.sort_by_key(|e| e.address);
        Ok(exports)
    }

    /// Import address table slots of the regular or delay-load import directory.
    fn imports(&self, address: u32, delay_load: bool) -> Result<Vec<Import>> {
        // Descriptor layouts: (size, name, IAT, INT)
        let (stride, name_at, iat_at, int_at) = if delay_load {
            (32, 4, 12, 16)
        } else {
            (20, 12, 16, 0)
        };

        let mut imports = Vec::new();
        let mut descriptor = self.va(address);
        loop {
            let name_rva = self.u32(descriptor + name_at)?;
            let iat_rva = self.u32(descriptor + iat_at)?;
            if name_rva == 0 || iat_rva == 0 {
                break;
            }
            let module = self.c_string(self.va(name_rva))?;
            let int_rva = match self.u32(descriptor + int_at)? {
                0 => iat_rva,
                rva => rva,
            };

            for slot in 0.. {
                let thunk = self.u64(self.va(int_rva) + slot * 8)?;
                if thunk == 0 {
                    break;
                }
                let name = if thunk & (1 << 63) != 0 {
                    None
                } else {
                    // IMAGE_IMPORT_BY_NAME: hint, then the name.
                    Some(self.c_string(self.va(thunk as u32) + 2)?)
                };
                imports.push(Import {
                    address: self.va(iat_rva) + slot * 8,
                    module: module.clone(),
                    name,
                    delay_load,
                });
            }
            descriptor += stride;
        }
        Ok(imports)
    }

    fn runtime_functions(&self, address: u32, size: u32, handlers: &HandlerNames) -> Vec<RuntimeFunction> {
        let start = self.va(address);
        let count = size as u64 / RUNTIME_FUNCTION_SIZE;
        let mut functions = Vec::with_capacity(count as usize);

        for entry in (0..count).map(|i| start + i * RUNTIME_FUNCTION_SIZE) {
            match self.runtime_function(entry, handlers) {
                Ok(function) => functions.push(function),
                Err(error) => warn!(
                    target: "fnbound::pe",
                    entry = format!("0x{:x}", entry),
                    %error,
                    "Skipping runtime function"
                ),
            }
        }
        functions
    }

    fn runtime_function(&self, entry: u64, handlers: &HandlerNames) -> Result<RuntimeFunction> {
        let begin = self.va(self.u32(entry)?);
        let end = self.va(self.u32(entry + 4)?);
        let unwind_info = self.va(self.u32(entry + 8)?);

        let mut function = RuntimeFunction {
            begin,
            end,
            unwind_info,
            handler: None,
            scope_records: Vec::new(),
        };

        // Follow chained entries to the unwind info owning the handler.
        let mut info = unwind_info;
        for _ in 0..MAX_CHAIN_DEPTH {
            let flags = self.image.read(info, 1).context("Unwind info out of range")?[0] >> 3;
            let code_count = self.image.read(info + 2, 1).context("Unwind info out of range")?[0] as u64;
            let trailer = info + 4 + 2 * ((code_count + 1) & !1);

            if flags & UNW_FLAG_CHAININFO != 0 {
                info = self.va(self.u32(trailer + 8)?);
                continue;
            }
            if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
                let handler = self.va(self.u32(trailer)?);
                function.handler = Some(handler);
                if handlers.is_c_specific(handler) {
                    function.scope_records = self.scope_records(trailer + 4)?;
                }
            }
            break;
        }
        Ok(function)
    }

    fn scope_records(&self, table: u64) -> Result<Vec<ScopeRecord>> {
        let count = self.u32(table)? as u64;
        (0..count)
            .map(|i| {
                let record = table + 4 + i * 16;
                let handler = self.u32(record + 8)?;
                let jump_target = self.u32(record + 12)?;
                Ok(ScopeRecord {
                    begin: self.va(self.u32(record)?),
                    end: self.va(self.u32(record + 4)?),
                    // Filter constants stay raw.
                    handler: if handler > 1 { self.va(handler) } else { handler as u64 },
                    jump_target: if jump_target != 0 { self.va(jump_target) } else { 0 },
                })
            })
            .collect()
    }

    fn load_config(&self, address: u32) -> Option<LoadConfig> {
        use load_config::*;

        let directory = self.va(address);
        let size = self.u32(directory).ok()? as u64;
        // Fields past the recorded size are absent.
        let field = |offset: u64| {
            if offset + 8 <= size {
                self.u64(directory + offset).ok()
            } else {
                None
            }
        };

        let guard_flags = if GUARD_FLAGS + 4 <= size {
            self.u32(directory + GUARD_FLAGS).ok()?
        } else {
            0
        };
        let mut config = LoadConfig {
            security_cookie: field(SECURITY_COOKIE).unwrap_or(0),
            guard_cf_check_function_pointer: field(GUARD_CF_CHECK_FUNCTION_POINTER).unwrap_or(0),
            guard_cf_dispatch_function_pointer: field(GUARD_CF_DISPATCH_FUNCTION_POINTER).unwrap_or(0),
            guard_cf_function_table: field(GUARD_CF_FUNCTION_TABLE).unwrap_or(0),
            guard_eh_continuation_table: field(GUARD_EH_CONTINUATION_TABLE).unwrap_or(0),
            guard_memcpy_function_pointer: field(GUARD_MEMCPY_FUNCTION_POINTER).unwrap_or(0),
            guard_xfg_check_function_pointer: field(GUARD_XFG_CHECK_FUNCTION_POINTER).unwrap_or(0),
            guard_xfg_dispatch_function_pointer: field(GUARD_XFG_DISPATCH_FUNCTION_POINTER).unwrap_or(0),
            guard_xfg_table_dispatch_function_pointer: field(GUARD_XFG_TABLE_DISPATCH_FUNCTION_POINTER)
                .unwrap_or(0),
            guard_flags,
            guard_cf_functions: Vec::new(),
            guard_eh_continuations: Vec::new(),
        };

        let stride = 4 + ((guard_flags & GUARD_CF_FUNCTION_TABLE_SIZE_MASK) >> GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT) as u64;
        let cf_count = field(GUARD_CF_FUNCTION_COUNT).unwrap_or(0);
        for i in 0..cf_count {
            let entry = config.guard_cf_function_table + i * stride;
            let Ok(rva) = self.u32(entry) else { break };
            let flags = if stride > 4 {
                self.image.read(entry + 4, 1).map_or(0, |b| b[0])
            } else {
                0
            };
            config.guard_cf_functions.push(GuardFunction {
                address: self.va(rva),
                flags,
            });
        }

        let eh_count = field(GUARD_EH_CONTINUATION_COUNT).unwrap_or(0);
        for i in 0..eh_count {
            let Ok(rva) = self.u32(config.guard_eh_continuation_table + i * stride) else { break };
            config.guard_eh_continuations.push(self.va(rva));
        }

        Some(config)
    }
}

/// Recognizes the C-specific exception handler, whose language data is a scope table.
struct HandlerNames<'a> {
    image: &'a Image,
    names: FxHashMap<u64, &'a str>,
    import_names: FxHashMap<u64, &'a str>,
}

impl HandlerNames<'_> {
    fn name(&self, handler: u64) -> Option<&str> {
        if let Some(&name) = self.names.get(&handler) {
            return Some(name);
        }
        // jmp qword ptr [rip+disp32] through an import slot.
        let stub = self.image.read(handler, 6)?;
        if stub[..2] != [0xff, 0x25] {
            return None;
        }
        let displacement = i32::from_le_bytes([stub[2], stub[3], stub[4], stub[5]]);
        let slot = (handler + 6).wrapping_add_signed(displacement as i64);
        self.import_names.get(&slot).copied()
    }

    fn is_c_specific(&self, handler: u64) -> bool {
        self.name(handler).is_some_and(|name| {
            matches!(
                name.trim_start_matches('_'),
                "C_specific_handler" | "C_specific_handler_noexcept"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::image_with;

    #[test]
    fn test_scope_table_behind_import_stub() {
        // 0x1000: jmp [rip+0x6ffa] -> IAT slot 0x8000
        let mut unwind = vec![
            0x09, 0x00, 0x00, 0x00, // version 1, UNW_FLAG_EHANDLER, no codes
            0x00, 0x10, 0x00, 0x00, // handler rva 0x1000
            0x01, 0x00, 0x00, 0x00, // one scope record
        ];
        for value in [0x1100u32, 0x1120, 1, 0x1130] {
            unwind.extend(value.to_le_bytes());
        }
        let entry: Vec<u8> = [0x1100u32, 0x1140, 0x8100]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let image = image_with(
            &[(0x1000, &[0xff, 0x25, 0xfa, 0x6f, 0x00, 0x00])],
            &[(0x8100, &unwind), (0x8200, &entry)],
        );
        let handlers = HandlerNames {
            image: &image,
            names: FxHashMap::default(),
            import_names: FxHashMap::from_iter([(0x8000, "__C_specific_handler")]),
        };
        assert!(handlers.is_c_specific(0x1000));

        let reader = DirectoryReader { image: &image };
        let functions = reader.runtime_functions(0x8200, 12, &handlers);
        assert_eq!(functions.len(), 1);
        let function = &functions[0];
        assert_eq!((function.begin, function.end), (0x1100, 0x1140));
        assert_eq!(function.handler, Some(0x1000));
        assert_eq!(
            function.scope_records,
            [ScopeRecord {
                begin: 0x1100,
                end: 0x1120,
                handler: 1,
                jump_target: 0x1130,
            }]
        );
    }

    #[test]
    fn test_chained_unwind_info_is_followed() {
        let mut data = vec![
            0x21, 0x00, 0x00, 0x00, // version 1, UNW_FLAG_CHAININFO, no codes
        ];
        for value in [0x1000u32, 0x1010, 0x8180] {
            data.extend(value.to_le_bytes());
        }
        let parent = [0x11, 0x00, 0x00, 0x00, 0x50, 0x10, 0x00, 0x00]; // UNW_FLAG_UHANDLER, handler 0x1050
        let entry: Vec<u8> = [0x1020u32, 0x1030, 0x8100]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let image = image_with(&[], &[(0x8100, &data), (0x8180, &parent), (0x8200, &entry)]);
        let handlers = HandlerNames {
            image: &image,
            names: FxHashMap::default(),
            import_names: FxHashMap::default(),
        };

        let reader = DirectoryReader { image: &image };
        let function = reader.runtime_function(0x8200, &handlers).unwrap();
        assert_eq!(function.handler, Some(0x1050));
        assert!(function.scope_records.is_empty());
    }

    #[test]
    fn test_load_config_tables() {
        let mut config = vec![0u8; 320];
        config[..4].copy_from_slice(&320u32.to_le_bytes());
        config[88..96].copy_from_slice(&0x8400u64.to_le_bytes());
        config[128..136].copy_from_slice(&0x8300u64.to_le_bytes());
        config[136..144].copy_from_slice(&2u64.to_le_bytes());
        // One extra byte per entry.
        config[144..148].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        let table = [0x00, 0x10, 0x00, 0x00, 0x08, 0x20, 0x10, 0x00, 0x00, 0x00];
        let image = image_with(&[], &[(0x8000, &config), (0x8300, &table)]);

        let reader = DirectoryReader { image: &image };
        let config = reader.load_config(0x8000).unwrap();
        assert_eq!(config.security_cookie, 0x8400);
        let functions: Vec<_> = config
            .guard_cf_functions
            .iter()
            .map(|f| (f.address, f.has_xfg_hash()))
            .collect();
        assert_eq!(functions, [(0x1000, true), (0x1020, false)]);
        assert!(config.guard_eh_continuations.is_empty());
    }
}

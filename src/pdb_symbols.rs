use crate::evidence::{Symbol, SymbolKind};
use anyhow::{Context, Result};
use memmap2::Mmap;
use pdb::{FallibleIterator, PDB, Source, SourceSlice, SourceView, SymbolData};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// A PDB file read through a memory map.
struct MappedPdb {
    mmap: Mmap,
}

struct MappedView {
    data: Vec<u8>,
}

impl fmt::Debug for MappedPdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappedPdb({} bytes)", self.mmap.len())
    }
}

impl fmt::Debug for MappedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappedView({} bytes)", self.data.len())
    }
}

impl SourceView<'_> for MappedView {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl<'s> Source<'s> for MappedPdb {
    fn view(&mut self, slices: &[SourceSlice]) -> Result<Box<dyn SourceView<'s>>, io::Error> {
        let mut data = Vec::with_capacity(slices.iter().map(|s| s.size).sum());
        for slice in slices {
            let start = slice.offset as usize;
            let bytes = start
                .checked_add(slice.size)
                .and_then(|end| self.mmap.get(start..end))
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("PDB slice 0x{:x}+0x{:x} past end of file", start, slice.size),
                    )
                })?;
            data.extend_from_slice(bytes);
        }
        Ok(Box::new(MappedView { data }))
    }
}

/// Load procedure, public and data symbols, one per address, with addresses
/// rebased onto `image_base`.
///
/// A procedure and a public symbol at the same address are merged: the
/// public (decorated) name becomes `name`, the procedure name `undecorated`.
pub fn load_symbols(pdb_path: &Path, image_base: u64) -> Result<Vec<Symbol>> {
    let file = File::open(pdb_path).with_context(|| format!("Failed to open PDB file: {:?}", pdb_path))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let mut pdb = PDB::open(MappedPdb { mmap }).with_context(|| format!("Failed to parse PDB file: {:?}", pdb_path))?;
    let address_map = pdb.address_map()?;

    let mut symbols: BTreeMap<u64, Symbol> = BTreeMap::new();
    let mut add = |data: SymbolData| {
        let (offset, entry) = match data {
            SymbolData::Procedure(proc) => (
                proc.offset,
                Entry::Procedure {
                    name: proc.name.to_string().into_owned(),
                    len: proc.len as u64,
                    no_return: proc.flags.never,
                },
            ),
            SymbolData::Public(public) => (
                public.offset,
                Entry::Public {
                    name: public.name.to_string().into_owned(),
                    code: public.code || public.function,
                },
            ),
            SymbolData::Data(data) => (
                data.offset,
                Entry::Data {
                    name: data.name.to_string().into_owned(),
                },
            ),
            _ => return,
        };
        if let Some(rva) = offset.to_rva(&address_map) {
            entry.merge_into(&mut symbols, image_base + rva.0 as u64);
        }
    };

    let global_symbols = pdb.global_symbols()?;
    let mut iter = global_symbols.iter();
    while let Some(symbol) = iter.next()? {
        if let Ok(data) = symbol.parse() {
            add(data);
        }
    }

    let dbi = pdb.debug_information()?;
    let mut modules = dbi.modules()?;
    while let Some(module) = modules.next()? {
        let Some(module_info) = pdb.module_info(&module)? else {
            continue;
        };
        let mut module_symbols = module_info.symbols()?;
        while let Some(symbol) = module_symbols.next()? {
            if let Ok(data @ SymbolData::Procedure(_)) = symbol.parse() {
                add(data);
            }
        }
    }

    let symbols: Vec<Symbol> = symbols.into_values().collect();
    info!(
        target: "fnbound::pdb",
        path = %pdb_path.display(),
        symbols = symbols.len(),
        functions = symbols.iter().filter(|s| s.kind == SymbolKind::Function).count(),
        "Loaded symbols"
    );
    Ok(symbols)
}

enum Entry {
    Procedure { name: String, len: u64, no_return: bool },
    Public { name: String, code: bool },
    Data { name: String },
}

impl Entry {
    fn merge_into(self, symbols: &mut BTreeMap<u64, Symbol>, address: u64) {
        let symbol = symbols.entry(address).or_insert_with(|| Symbol {
            address,
            name: String::new(),
            undecorated: None,
            length: 0,
            kind: SymbolKind::Data,
            no_return: false,
        });

        match self {
            Entry::Procedure { name, len, no_return } => {
                if symbol.name.is_empty() {
                    symbol.name = name.clone();
                }
                symbol.undecorated = Some(name);
                symbol.length = symbol.length.max(len);
                symbol.kind = SymbolKind::Function;
                symbol.no_return |= no_return;
            }
            Entry::Public { name, code } => {
                debug!(target: "fnbound::pdb", address = format!("0x{:x}", address), %name, "Public symbol");
                symbol.name = name;
                if code && symbol.kind == SymbolKind::Data {
                    symbol.kind = SymbolKind::Code;
                }
            }
            Entry::Data { name } => {
                if symbol.name.is_empty() {
                    symbol.name = name;
                }
            }
        }
    }
}

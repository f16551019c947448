use blazesym::symbolize::source::{Kernel, Source};
use blazesym::symbolize::{Input, Sym, Symbolized, Symbolizer};
use blazesym::Addr;
use log::warn;

const ADDR_WIDTH: usize = 16;

/// Turns raw kernel return addresses into printable frames.
pub trait StackSymbolizer {
    fn symbolize(&mut self, stack: &[u64]) -> Vec<String>;
}

fn format_frames<'a, I>(syms: I) -> Vec<String>
where
    I: IntoIterator<Item = (Addr, Symbolized<'a>)>,
{
    let mut ret = Vec::new();
    for (input_addr, sym) in syms {
        match sym {
            Symbolized::Sym(Sym {
                name,
                offset,
                inlined,
                ..
            }) => {
                ret.push(format!(
                    "{input_addr:#0width$x}: {name}+{offset:#x}",
                    width = ADDR_WIDTH
                ));
                for inline in inlined.iter() {
                    ret.push(format!(
                        "{:width$}  {} [inlined]",
                        " ",
                        inline.name,
                        width = ADDR_WIDTH
                    ));
                }
            }
            Symbolized::Unknown(e) => {
                ret.push(format!(
                    "{input_addr:#0width$x}: <unknown: {e}>",
                    width = ADDR_WIDTH
                ));
            }
        }
    }
    ret
}

/// Kernel-only symbolizer over `/proc/kallsyms` and the running vmlinux.
pub struct KernelSymbolizer<'a> {
    symbolizer: Symbolizer,
    kernel_src: Source<'a>,
}

impl Default for KernelSymbolizer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelSymbolizer<'_> {
    pub fn new() -> Self {
        KernelSymbolizer {
            symbolizer: Symbolizer::new(),
            kernel_src: Source::Kernel(Kernel::default()),
        }
    }
}

impl StackSymbolizer for KernelSymbolizer<'_> {
    fn symbolize(&mut self, stack: &[u64]) -> Vec<String> {
        if stack.is_empty() {
            return Vec::new();
        }
        match self.symbolizer.symbolize(&self.kernel_src, Input::AbsAddr(stack)) {
            Ok(syms) => format_frames(stack.iter().copied().zip(syms)),
            Err(e) => {
                // Raw addresses are still better than nothing.
                warn!("failed to symbolize kernel stack: {e}");
                stack
                    .iter()
                    .map(|addr| format!("{addr:#0width$x}", width = ADDR_WIDTH))
                    .collect()
            }
        }
    }
}

/// Leaves every frame as a bare address. Used when symbolization is not
/// wanted and by tests.
#[derive(Debug, Default)]
pub struct RawAddresses;

impl StackSymbolizer for RawAddresses {
    fn symbolize(&mut self, stack: &[u64]) -> Vec<String> {
        stack
            .iter()
            .map(|addr| format!("{addr:#0width$x}", width = ADDR_WIDTH))
            .collect()
    }
}

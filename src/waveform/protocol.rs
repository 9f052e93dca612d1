//! Protocol waveforms: sparse waveforms of decoder-defined symbols.

use super::{SparseWaveform, WaveformBase};
use crate::accel::Element;
use crate::types::Color;
use std::any::Any;
use std::fmt;

/// A decoded protocol symbol.
pub trait ProtocolSymbol: Element + fmt::Debug + PartialEq {
    /// Text shown inside the symbol's box.
    fn text(&self) -> String;
    fn color(&self) -> Color;
}

/// Type-erased protocol waveform held by a stream.
pub trait ProtocolWaveform: WaveformBase + fmt::Debug {
    fn text(&self, i: usize) -> String;
    fn color(&self, i: usize) -> Color;
    /// Rust type name of the symbol, used to validate decoder inputs.
    fn symbol_type(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<S: ProtocolSymbol> ProtocolWaveform for SparseWaveform<S> {
    fn text(&self, i: usize) -> String {
        self.samples[i].text()
    }

    fn color(&self, i: usize) -> Color {
        self.samples[i].color()
    }

    fn symbol_type(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn ProtocolWaveform {
    pub fn downcast_ref<S: ProtocolSymbol>(&self) -> Option<&SparseWaveform<S>> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<S: ProtocolSymbol>(&mut self) -> Option<&mut SparseWaveform<S>> {
        self.as_any_mut().downcast_mut()
    }

    pub fn is<S: ProtocolSymbol>(&self) -> bool {
        self.as_any().is::<SparseWaveform<S>>()
    }
}

//! Per-variable and per-equation metadata attached once a model carries EMP
//! structure (or becomes an MCP).

use bitflags::bitflags;

use crate::empdag::uid::{MPID_NA, MpId};
use crate::{IDX_NA, Idx};

bitflags! {
    /// Property bits of a variable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarPpty: u16 {
        const IS_DELETED               = 1 << 0;
        const IS_EXPLICITLY_DEFINED    = 1 << 1;
        const IS_OBJ_MIN               = 1 << 2;
        const IS_OBJ_MAX               = 1 << 3;
        /// Matched with a nontrivial VI function.
        const PERP_TO_VI_FUNCTION      = 1 << 4;
        /// Matched with the zero function in a VI.
        const PERP_TO_ZERO_FUNCTION_VI = 1 << 5;
        const IS_MULTIPLIER            = 1 << 6;
    }
}

bitflags! {
    /// Property bits of an equation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EquPpty: u16 {
        const IS_DELETED    = 1 << 0;
        const IS_FLIPPED    = 1 << 1;
        const IS_INHERITED  = 1 << 2;
    }
}

/// Role of a variable inside its owning MP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarRole {
    #[default]
    Undefined,
    Primal,
    Dual,
    Objective,
    DefiningMap,
}

/// Role of an equation inside its owning MP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EquRole {
    #[default]
    Undefined,
    Constraint,
    ViFunction,
    Objective,
    IsMap,
}

/// Mutually-exclusive VI-matching kind extracted from the property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarBasicType {
    Plain,
    PerpToViFunction,
    PerpToZeroFunctionVi,
}

#[derive(Debug, Clone, Copy)]
pub struct VarMeta {
    /// Owning MP, or [`MPID_NA`].
    pub mp_id: MpId,
    pub role: VarRole,
    pub ppty: VarPpty,
    /// Paired equation, or [`IDX_NA`].
    pub dual: Idx,
}

impl Default for VarMeta {
    fn default() -> Self {
        Self {
            mp_id: MPID_NA,
            role: VarRole::Undefined,
            ppty: VarPpty::empty(),
            dual: IDX_NA,
        }
    }
}

impl VarMeta {
    pub fn basic_type(&self) -> VarBasicType {
        if self.ppty.contains(VarPpty::PERP_TO_ZERO_FUNCTION_VI) {
            VarBasicType::PerpToZeroFunctionVi
        } else if self.ppty.contains(VarPpty::PERP_TO_VI_FUNCTION) {
            VarBasicType::PerpToViFunction
        } else {
            VarBasicType::Plain
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EquMeta {
    /// Owning MP, or [`MPID_NA`].
    pub mp_id: MpId,
    pub role: EquRole,
    pub ppty: EquPpty,
    /// Paired variable, or [`IDX_NA`].
    pub dual: Idx,
}

impl Default for EquMeta {
    fn default() -> Self {
        Self {
            mp_id: MPID_NA,
            role: EquRole::Undefined,
            ppty: EquPpty::empty(),
            dual: IDX_NA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_type_extraction() {
        let mut meta = VarMeta::default();
        assert_eq!(meta.basic_type(), VarBasicType::Plain);
        meta.ppty |= VarPpty::PERP_TO_VI_FUNCTION;
        assert_eq!(meta.basic_type(), VarBasicType::PerpToViFunction);
        meta.ppty |= VarPpty::PERP_TO_ZERO_FUNCTION_VI;
        assert_eq!(meta.basic_type(), VarBasicType::PerpToZeroFunctionVi);
    }
}

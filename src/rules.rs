use crate::gadget::{GadgetKind, KindFilter};
use iced_x86::{Code, FlowControl, Instruction, Mnemonic, OpKind, Register};

fn is_invalid(instr: &Instruction) -> bool { matches!(instr.code(), Code::INVALID) }

fn is_ret(instr: &Instruction) -> bool {
	matches!(instr.mnemonic(), Mnemonic::Ret | Mnemonic::Retf)
}

fn is_sys(instr: &Instruction) -> bool {
	match instr.mnemonic() {
		Mnemonic::Syscall | Mnemonic::Sysenter => true,
		// legacy 32-bit syscall gate
		Mnemonic::Int => instr.immediate8() == 0x80,
		_ => false,
	}
}

fn is_jop(instr: &Instruction) -> bool {
	match instr.mnemonic() {
		Mnemonic::Jmp | Mnemonic::Call => match instr.op0_kind() {
			OpKind::Register => true,
			OpKind::Memory => !matches!(instr.memory_base(), Register::EIP | Register::RIP),
			_ => false,
		},
		_ => false,
	}
}

/// Classifies a terminator instruction, or `None` if the instruction cannot
/// end a gadget of an admitted kind.
pub fn classify_tail(instr: &Instruction, filter: KindFilter) -> Option<GadgetKind> {
	if is_invalid(instr) {
		return None;
	}
	if instr.flow_control() == FlowControl::Next {
		return None;
	}
	let kind = if is_ret(instr) {
		GadgetKind::Rop
	}
	else if is_sys(instr) {
		GadgetKind::Sys
	}
	else if is_jop(instr) {
		GadgetKind::Jop
	}
	else {
		return None;
	};
	filter.admits(kind).then_some(kind)
}

/// True iff the instruction may appear mid-sequence: it must fall through and
/// carry no lock/rep style prefix.
pub fn is_gadget_body(instr: &Instruction) -> bool {
	if is_invalid(instr) {
		return false;
	}
	if instr.has_lock_prefix()
		|| instr.has_rep_prefix()
		|| instr.has_repe_prefix()
		|| instr.has_repne_prefix()
		|| instr.has_xacquire_prefix()
		|| instr.has_xrelease_prefix()
	{
		return false;
	}
	instr.flow_control() == FlowControl::Next
}

/// `pop <reg>` with a register operand, for the pop-pop-ret scan.
pub fn is_pop_reg(instr: &Instruction) -> bool {
	instr.mnemonic() == Mnemonic::Pop && instr.op0_kind() == OpKind::Register
}

/// `jmp <reg>` / `call <reg>` on one of the named registers.
pub fn is_jmp_to_named_reg(instr: &Instruction, regs: &[String]) -> bool {
	if !matches!(instr.mnemonic(), Mnemonic::Jmp | Mnemonic::Call) {
		return false;
	}
	if instr.op0_kind() != OpKind::Register {
		return false;
	}
	let name = format!("{:?}", instr.op0_register()).to_ascii_lowercase();
	regs.iter().any(|r| r.eq_ignore_ascii_case(&name))
}

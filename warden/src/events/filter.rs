//! The in-kernel filter attached to the event socket.
//!
//! Classic BPF, evaluated per datagram before userspace is woken. The
//! program accepts a datagram only when the outer message is a plain
//! data message, the connector identity matches the process event feed,
//! and the event is a whole-process fork (`child_tgid == child_pid`) or
//! a whole-process exit (`process_tgid == process_pid`). Per-thread
//! events and all other connector traffic are dropped in the kernel.
//!
//! BPF loads are big-endian regardless of host order, so every
//! comparison constant goes through a `to_be` conversion. Jump offsets
//! are the classic off-by-one trap; they are resolved here from
//! symbolic labels and asserted during assembly.

use libc::sock_filter;

use super::{
    CN_IDX_PROC, CN_MSG_HDRLEN, CN_MSG_IDX_OFFSET, CN_MSG_VAL_OFFSET, CN_VAL_PROC,
    EVENT_DATA_OFFSET, EVENT_WHAT_OFFSET, EXIT_PROCESS_PID_OFFSET, EXIT_PROCESS_TGID_OFFSET,
    FORK_CHILD_PID_OFFSET, FORK_CHILD_TGID_OFFSET, NLMSG_HDRLEN, NLMSG_TYPE_OFFSET,
    PROC_EVENT_EXIT, PROC_EVENT_FORK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    /// Start of the fork checks, entered when the event is not an exit.
    ForkCheck,
    Accept,
    Drop,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    /// Fall through to the next instruction.
    Next,
    To(Label),
}

enum Step {
    Insn {
        code: u16,
        jt: Target,
        jf: Target,
        k: u32,
    },
    Mark(Label),
}

fn stmt(code: u32, k: u32) -> Step {
    Step::Insn {
        code: code as u16,
        jt: Target::Next,
        jf: Target::Next,
        k,
    }
}

fn jeq(k: u32, jt: Target, jf: Target) -> Step {
    Step::Insn {
        code: (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
        jt,
        jf,
        k,
    }
}

fn jeq_x(jt: Target, jf: Target) -> Step {
    Step::Insn {
        code: (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_X) as u16,
        jt,
        jf,
        k: 0,
    }
}

/// The filter program, assembled fresh for every attach.
pub(crate) fn proc_event_program() -> Vec<sock_filter> {
    use Label::{Accept, Drop, ForkCheck};
    use Target::{Next, To};

    let what_offset = (NLMSG_HDRLEN + CN_MSG_HDRLEN + EVENT_WHAT_OFFSET) as u32;
    let payload_offset = NLMSG_HDRLEN + CN_MSG_HDRLEN + EVENT_DATA_OFFSET;

    let steps = [
        // Only plain data messages; everything else dies in the kernel.
        stmt(
            libc::BPF_LD | libc::BPF_H | libc::BPF_ABS,
            NLMSG_TYPE_OFFSET as u32,
        ),
        jeq(
            u32::from((libc::NLMSG_DONE as u16).to_be()),
            Next,
            To(Drop),
        ),
        // Only the process connector's identity pair.
        stmt(
            libc::BPF_LD | libc::BPF_W | libc::BPF_ABS,
            (NLMSG_HDRLEN + CN_MSG_IDX_OFFSET) as u32,
        ),
        jeq(CN_IDX_PROC.to_be(), Next, To(Drop)),
        stmt(
            libc::BPF_LD | libc::BPF_W | libc::BPF_ABS,
            (NLMSG_HDRLEN + CN_MSG_VAL_OFFSET) as u32,
        ),
        jeq(CN_VAL_PROC.to_be(), Next, To(Drop)),
        // Exit events: accept only whole-process exits.
        stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, what_offset),
        jeq(PROC_EVENT_EXIT.to_be(), Next, To(ForkCheck)),
        stmt(
            libc::BPF_LD | libc::BPF_W | libc::BPF_ABS,
            (payload_offset + EXIT_PROCESS_PID_OFFSET) as u32,
        ),
        stmt(libc::BPF_ST, 0),
        stmt(libc::BPF_LDX | libc::BPF_W | libc::BPF_MEM, 0),
        stmt(
            libc::BPF_LD | libc::BPF_W | libc::BPF_ABS,
            (payload_offset + EXIT_PROCESS_TGID_OFFSET) as u32,
        ),
        jeq_x(To(Accept), To(Drop)),
        // Fork events: accept only whole-process forks.
        Step::Mark(ForkCheck),
        stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, what_offset),
        jeq(PROC_EVENT_FORK.to_be(), Next, To(Drop)),
        stmt(
            libc::BPF_LD | libc::BPF_W | libc::BPF_ABS,
            (payload_offset + FORK_CHILD_TGID_OFFSET) as u32,
        ),
        stmt(libc::BPF_ST, 0),
        stmt(libc::BPF_LDX | libc::BPF_W | libc::BPF_MEM, 0),
        stmt(
            libc::BPF_LD | libc::BPF_W | libc::BPF_ABS,
            (payload_offset + FORK_CHILD_PID_OFFSET) as u32,
        ),
        jeq_x(To(Accept), To(Drop)),
        Step::Mark(Accept),
        stmt(libc::BPF_RET | libc::BPF_K, u32::MAX),
        Step::Mark(Drop),
        stmt(libc::BPF_RET | libc::BPF_K, 0),
    ];

    assemble(&steps)
}

/// Resolves labels to relative jump offsets and emits the instruction
/// array. Panics on an unresolvable or out-of-range jump, which would
/// mean the program above is malformed.
fn assemble(steps: &[Step]) -> Vec<sock_filter> {
    let mut labels: Vec<(Label, usize)> = Vec::new();
    let mut index = 0usize;
    for step in steps {
        match step {
            Step::Mark(label) => labels.push((*label, index)),
            Step::Insn { .. } => index += 1,
        }
    }

    let resolve = |target: Target, at: usize| -> u8 {
        match target {
            Target::Next => 0,
            Target::To(label) => {
                let position = labels
                    .iter()
                    .find(|(marked, _)| *marked == label)
                    .map(|(_, position)| *position)
                    .expect("every jump target is marked");
                assert!(position > at, "backward jump in filter program");
                let delta = position - at - 1;
                assert!(delta <= usize::from(u8::MAX), "jump offset out of range");
                delta as u8
            }
        }
    };

    let mut program = Vec::with_capacity(index);
    let mut at = 0usize;
    for step in steps {
        if let Step::Insn { code, jt, jf, k } = step {
            program.push(sock_filter {
                code: *code,
                jt: resolve(*jt, at),
                jf: resolve(*jf, at),
                k: *k,
            });
            at += 1;
        }
    }
    program
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// The low three bits of the opcode are the instruction class.
    fn is_jump(insn: &sock_filter) -> bool {
        u32::from(insn.code) & 0x07 == libc::BPF_JMP
    }

    #[test]
    fn program_has_expected_shape() {
        let program = proc_event_program();
        assert_eq!(program.len(), 22);

        // The two terminal instructions: accept-all and drop.
        let accept = &program[20];
        assert_eq!(
            accept.code,
            (libc::BPF_RET | libc::BPF_K) as u16,
        );
        assert_eq!(accept.k, u32::MAX);
        let drop = &program[21];
        assert_eq!(drop.code, (libc::BPF_RET | libc::BPF_K) as u16);
        assert_eq!(drop.k, 0);
    }

    #[test]
    fn jump_offsets_resolve_to_the_hand_checked_table() {
        let program = proc_event_program();
        let jumps: Vec<(usize, u8, u8)> = program
            .iter()
            .enumerate()
            .filter(|(_, insn)| is_jump(insn))
            .map(|(index, insn)| (index, insn.jt, insn.jf))
            .collect();
        assert_eq!(
            jumps,
            vec![
                (1, 0, 19),  // not NLMSG_DONE -> drop
                (3, 0, 17),  // wrong connector idx -> drop
                (5, 0, 15),  // wrong connector val -> drop
                (7, 0, 5),   // not an exit -> fork checks
                (12, 7, 8),  // exit tgid==pid -> accept, else drop
                (14, 0, 6),  // not a fork either -> drop
                (19, 0, 1),  // fork tgid==pid -> accept, else drop
            ]
        );
    }

    #[test]
    fn every_jump_lands_inside_the_program() {
        let program = proc_event_program();
        for (index, insn) in program.iter().enumerate() {
            if is_jump(insn) {
                assert!(index + 1 + usize::from(insn.jt) < program.len());
                assert!(index + 1 + usize::from(insn.jf) < program.len());
            }
        }
    }

    #[test]
    fn loads_point_at_the_event_fields() {
        let program = proc_event_program();
        // nlmsg_type, connector idx/val, then proc_event.what for both
        // branches.
        assert_eq!(program[0].k, 4);
        assert_eq!(program[2].k, 16);
        assert_eq!(program[4].k, 20);
        assert_eq!(program[6].k, 36);
        assert_eq!(program[14].k, 36);
        // exit: process_pid then process_tgid.
        assert_eq!(program[8].k, 52);
        assert_eq!(program[11].k, 56);
        // fork: child_tgid then child_pid.
        assert_eq!(program[16].k, 64);
        assert_eq!(program[18].k, 60);
    }
}

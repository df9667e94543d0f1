// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Passes and rules: sequencing rule code over the slot chain
//!
//! A pass walks the chain from the head. At each position it tries its
//! rules in declaration order: the first rule whose constraint succeeds has
//! its action run, and the walk continues at the slot following the rule's
//! consumption. When no rule matches, the walk advances one chain step.
//! Later passes see the mutated chain produced by earlier ones.
//!
//! Pass layout within the Silf sub-table (big-endian):
//!
//! ```none
//! Pass: flags u8, maxRuleLoop u8, numRules u16, constraintLen u32,
//!       rule records, pass constraint bytecode, rule bytecode blob
//! Rule: sortKey u16, preContext u8, reserved u8, constraintOffset u32,
//!       constraintLen u32, actionOffset u32, actionLen u32
//! ```
//!
//! Rule code offsets are relative to the start of the blob, which follows
//! the pass constraint.

use crate::segment::{Segment, SlotRef};
use crate::silf::Silf;
use crate::tables::{Bytes, Error, Tag};
use crate::vm::{Code, CodeContext, Machine, MachineStatus, SlotMap, INSTRUCTION_BUDGET};
use log::{debug, warn};
use smallvec::SmallVec;

/// Flag bit: this pass participates in collision avoidance
pub(crate) const PASS_COLLISIONS: u8 = 0x01;

const RULE_RECORD_LEN: usize = 20;

/// Matches allowed at one position before the walk is forced onward
const DEFAULT_RULE_LOOP: u8 = 15;

/// A (constraint, action) pair with its declared match window
pub(crate) struct Rule {
    sort_key: u16,
    pre_context: u8,
    constraint: Option<Code>,
    action: Code,
}

impl Rule {
    #[inline]
    pub fn sort_key(&self) -> u16 {
        self.sort_key
    }

    #[inline]
    pub fn pre_context(&self) -> u8 {
        self.pre_context
    }
}

/// One ordered rule set applied in one walk of the chain
pub(crate) struct Pass {
    flags: u8,
    max_rule_loop: u8,
    constraint: Option<Code>,
    rules: Vec<Rule>,
}

impl Pass {
    #[inline]
    pub fn collides(&self) -> bool {
        self.flags & PASS_COLLISIONS != 0
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

pub(crate) fn parse(b: Bytes, ctx: &CodeContext) -> Result<Pass, Error> {
    let bad = || Error::Malformed(Tag::SILF);
    let flags = b.u8(0).ok_or_else(bad)?;
    let max_rule_loop = b.u8(1).ok_or_else(bad)?;
    let num_rules = b.u16(2).ok_or_else(bad)?;
    let constraint_len = b.u32(4).ok_or_else(bad)? as usize;

    let records = 8;
    let constraint_at = records + usize::from(num_rules) * RULE_RECORD_LEN;
    let blob = b
        .slice_from(constraint_at + constraint_len)
        .ok_or_else(bad)?;

    let constraint = match constraint_len {
        0 => None,
        n => {
            let code = b.slice(constraint_at, n).ok_or_else(bad)?;
            Some(Code::load(true, code.0, 0, 1, ctx))
        }
    };

    let mut rules = Vec::with_capacity(num_rules.into());
    for r in 0..usize::from(num_rules) {
        let rec = records + r * RULE_RECORD_LEN;
        let sort_key = b.u16(rec).ok_or_else(bad)?;
        let pre_context = b.u8(rec + 2).ok_or_else(bad)?;
        let c_off = b.u32(rec + 4).ok_or_else(bad)? as usize;
        let c_len = b.u32(rec + 8).ok_or_else(bad)? as usize;
        let a_off = b.u32(rec + 12).ok_or_else(bad)? as usize;
        let a_len = b.u32(rec + 16).ok_or_else(bad)? as usize;

        let constraint = match c_len {
            0 => None,
            n => {
                let code = blob.slice(c_off, n).ok_or_else(bad)?;
                Some(Code::load(true, code.0, pre_context, sort_key, ctx))
            }
        };
        let action = match a_len {
            0 => Code::empty(false),
            n => {
                let code = blob.slice(a_off, n).ok_or_else(bad)?;
                Code::load(false, code.0, pre_context, sort_key, ctx)
            }
        };
        rules.push(Rule {
            sort_key,
            pre_context,
            constraint,
            action,
        });
    }

    Ok(Pass {
        flags,
        max_rule_loop,
        constraint,
        rules,
    })
}

/// Run every pass of `silf` over the segment
pub(crate) fn run_graphite(seg: &mut Segment, silf: &Silf) {
    let mut budget = INSTRUCTION_BUDGET;
    for (i, pass) in silf.passes().iter().enumerate() {
        if !pass_constraint_holds(seg, pass, &mut budget) {
            debug!("pass {i}: pre-pass constraint failed, skipped");
            continue;
        }
        if pass.collides() {
            // Collision avoidance is not performed; the rules still run
            debug!("pass {i}: collision flag set");
        }
        if !run_pass(seg, pass, &mut budget) {
            warn!("pass {i}: instruction budget exhausted, shaping truncated");
            break;
        }
    }
}

/// Evaluate a pass's pre-pass constraint at the segment start
fn pass_constraint_holds(seg: &mut Segment, pass: &Pass, budget: &mut u32) -> bool {
    let Some(constraint) = &pass.constraint else {
        return true;
    };
    let Some(first) = seg.first_slot() else {
        return true; // nothing to shape; the pass walk is a no-op anyway
    };
    let mut map = SlotMap::new(0);
    map.push(first);
    let mut m = Machine::new(seg, &mut map, budget);
    let ret = constraint.run(&mut m);
    match m.status() {
        MachineStatus::Finished => ret != 0,
        status => {
            debug!("pre-pass constraint aborted: {status:?}");
            false
        }
    }
}

/// Walk the chain once, applying the first matching rule at each position
///
/// Returns false when the instruction budget ran out.
fn run_pass(seg: &mut Segment, pass: &Pass, budget: &mut u32) -> bool {
    let max_loop = match pass.max_rule_loop {
        0 => DEFAULT_RULE_LOOP,
        n => n,
    };
    let mut loop_count: u8 = 0;
    let mut cur = seg.first_slot();

    while let Some(origin) = cur {
        match try_rules_at(seg, pass, origin, budget) {
            Outcome::Matched(next) => {
                if next == Some(origin) {
                    loop_count += 1;
                    if loop_count >= max_loop {
                        debug!("rule loop limit hit, forcing walk onward");
                        loop_count = 0;
                        cur = seg.slot(origin).next;
                        continue;
                    }
                } else {
                    loop_count = 0;
                }
                cur = next;
            }
            Outcome::NoMatch => {
                loop_count = 0;
                cur = seg.slot(origin).next;
            }
            Outcome::BudgetExhausted => return false,
        }
    }
    true
}

enum Outcome {
    /// A rule fired; continue the walk at this slot
    Matched(Option<SlotRef>),
    NoMatch,
    BudgetExhausted,
}

fn try_rules_at(
    seg: &mut Segment,
    pass: &Pass,
    origin: SlotRef,
    budget: &mut u32,
) -> Outcome {
    for rule in pass.rules() {
        let Some(mut map) = build_map(seg, origin, rule) else {
            continue; // not enough pre-context here
        };
        // The chain slot the walk resumes at when the rule consumes its
        // whole window. Not part of the map, so the action cannot free it.
        let resume = map.last().and_then(|s| seg.slot(s).next);

        if let Some(constraint) = &rule.constraint {
            let mut m = Machine::new(seg, &mut map, budget);
            let ret = constraint.run(&mut m);
            match m.status() {
                MachineStatus::Finished => {
                    if ret == 0 {
                        continue;
                    }
                }
                MachineStatus::RuntimeBudgetExhausted => return Outcome::BudgetExhausted,
                status => {
                    debug!("constraint aborted: {status:?}");
                    continue;
                }
            }
        }

        let mut m = Machine::new(seg, &mut map, budget);
        let ret = rule.action.run(&mut m);
        let is = m.input_index();
        match m.status() {
            MachineStatus::Finished => {
                if ret == 0 {
                    // Side-effect-free failure by contract; try the next rule
                    continue;
                }
                let next = match map.get(is) {
                    Some(s) => Some(s),
                    None => resume,
                };
                return Outcome::Matched(next);
            }
            MachineStatus::RuntimeBudgetExhausted => return Outcome::BudgetExhausted,
            status => {
                // Committed mutations stand; skip to the next position
                warn!("action aborted: {status:?}");
                let next = match seg.slot(origin).is_deleted() {
                    false => seg.slot(origin).next,
                    true => resume,
                };
                return Outcome::Matched(next);
            }
        }
    }
    Outcome::NoMatch
}

/// Collect the rule's slot window: pre-context slots, then the match
///
/// `None` when fewer than `pre_context` slots precede the origin. The
/// forward window may be shorter than `sort_key`; the machine's bounds
/// check rejects rules that would reach past it.
fn build_map(seg: &Segment, origin: SlotRef, rule: &Rule) -> Option<SlotMap> {
    let mut pre: SmallVec<[SlotRef; 8]> = SmallVec::new();
    let mut cur = seg.slot(origin).prev;
    for _ in 0..rule.pre_context() {
        let p = cur?;
        pre.push(p);
        cur = seg.slot(p).prev;
    }

    let mut map = SlotMap::new(pre.len());
    for &p in pre.iter().rev() {
        map.push(p);
    }
    let mut cur = Some(origin);
    for _ in 0..rule.sort_key().max(1) {
        let Some(s) = cur else { break };
        map.push(s);
        cur = seg.slot(s).next;
    }
    Some(map)
}

#[cfg(test)]
mod test {
    use crate::testfont::{ClassSpec, FontSpec, PassSpec, RuleSpec, SilfSpec};
    use crate::{Direction, Encoding, Face, Font, Segment};

    const SCRIPT: u32 = 0x6C617466;

    /// f=1 (adv 300), i=2 (adv 200), fi=3 (adv 450)
    fn ligature_font(passes: Vec<PassSpec>) -> FontSpec {
        FontSpec {
            advances: vec![0, 300, 200, 450],
            cmap: vec![('f' as u32, 1), ('i' as u32, 2)],
            silf: SilfSpec {
                classes: vec![ClassSpec::Linear(vec![3])],
                passes,
                ..Default::default()
            }
            .build(),
            ..Default::default()
        }
    }

    /// Constraint matching `f` then `i` by their advance widths
    fn pair_constraint() -> Vec<u8> {
        vec![
            42, 8, 0xFF, 0, // push_glyph_metric(AdvanceWidth, current)
            3, 1, 44, // push_short 300
            19, // equal
            42, 8, 0, 0, // push_glyph_metric(AdvanceWidth, next)
            3, 0, 200, // push_short 200
            19, // equal
            16, // and
            48, // pop_ret
        ]
    }

    /// Replace the pair with class 0's glyph, folding the second slot in
    fn ligate_action() -> Vec<u8> {
        vec![28, 0, 25, 32, 50] // put_glyph_8bit_obs 0; next; delete_; ret_true
    }

    fn ligature_rule() -> RuleSpec {
        RuleSpec {
            sort_key: 2,
            pre_context: 0,
            constraint: pair_constraint(),
            action: ligate_action(),
        }
    }

    fn shape(spec: &FontSpec, text: &str) -> (Vec<u16>, usize) {
        let font = spec.build();
        let face = Face::new(&&font).unwrap();
        let scaled = Font::new(1000.0, &face);
        let seg = Segment::make(
            &scaled,
            &face,
            SCRIPT,
            Encoding::Utf8,
            text.as_bytes(),
            text.len(),
            Direction::LeftToRight,
        );
        (seg.slots().map(|s| s.gid()).collect(), seg.slot_count())
    }

    #[test]
    fn ligature_substitution() {
        let spec = ligature_font(vec![PassSpec {
            rules: vec![ligature_rule()],
            ..Default::default()
        }]);
        let font = spec.build();
        let face = Face::new(&&font).unwrap();
        let scaled = Font::new(1000.0, &face);
        let seg = Segment::make(
            &scaled,
            &face,
            SCRIPT,
            Encoding::Utf8,
            b"fi",
            2,
            Direction::LeftToRight,
        );

        assert_eq!(seg.slot_count(), 1);
        let slot = seg.slots().next().unwrap();
        assert_eq!(slot.gid(), 3);
        assert_eq!(slot.before(), 0);
        assert_eq!(slot.after(), 1);
        assert_eq!(slot.original(), 0);
        assert_eq!(seg.advance_x(), 450.0);

        // Both characters map back to the surviving slot
        let sref = seg.first_slot();
        assert_eq!(seg.char_info(0).unwrap().before_slot(), sref);
        assert_eq!(seg.char_info(1).unwrap().after_slot(), sref);
    }

    #[test]
    fn constraint_gates_the_rule() {
        let spec = ligature_font(vec![PassSpec {
            rules: vec![ligature_rule()],
            ..Default::default()
        }]);
        // "if" has the advances in the wrong order: no match anywhere
        assert_eq!(shape(&spec, "if"), (vec![2, 1], 2));
        // Only the trailing pair matches
        assert_eq!(shape(&spec, "ifi"), (vec![2, 3], 2));
    }

    #[test]
    fn rules_try_in_declaration_order() {
        // Rule 0 never matches (constraint ret_zero); rule 1 ligates
        let spec = ligature_font(vec![PassSpec {
            rules: vec![
                RuleSpec {
                    sort_key: 1,
                    pre_context: 0,
                    constraint: vec![49], // ret_zero
                    action: vec![28, 0, 50],
                },
                ligature_rule(),
            ],
            ..Default::default()
        }]);
        assert_eq!(shape(&spec, "fi"), (vec![3], 1));
    }

    #[test]
    fn action_returning_zero_falls_through() {
        // Rule 0 matches but its action reports failure without mutating;
        // rule 1 then ligates at the same position
        let spec = ligature_font(vec![PassSpec {
            rules: vec![
                RuleSpec {
                    sort_key: 1,
                    pre_context: 0,
                    constraint: Vec::new(),
                    action: vec![2, 5, 2, 3, 6, 49], // push 5; push 3; add; ret_zero
                },
                ligature_rule(),
            ],
            ..Default::default()
        }]);
        assert_eq!(shape(&spec, "fi"), (vec![3], 1));
    }

    #[test]
    fn pass_constraint_skips_pass() {
        let mut pass = PassSpec {
            rules: vec![ligature_rule()],
            ..Default::default()
        };
        pass.constraint = vec![49]; // ret_zero: skip for this segment
        let spec = ligature_font(vec![pass]);
        assert_eq!(shape(&spec, "fi"), (vec![1, 2], 2));

        let mut pass = PassSpec {
            rules: vec![ligature_rule()],
            ..Default::default()
        };
        pass.constraint = vec![50]; // ret_true: pass runs
        let spec = ligature_font(vec![pass]);
        assert_eq!(shape(&spec, "fi"), (vec![3], 1));
    }

    #[test]
    fn later_pass_sees_earlier_mutations() {
        // Pass 0 ligates; pass 1 replaces the ligature (adv 450) with f
        let second = RuleSpec {
            sort_key: 1,
            pre_context: 0,
            constraint: vec![
                42, 8, 0xFF, 0, // push_glyph_metric(AdvanceWidth, current)
                3, 1, 194, // push_short 450
                19, // equal
                48, // pop_ret
            ],
            action: vec![28, 1, 50], // put_glyph_8bit_obs(class 1)
        };
        let mut spec = ligature_font(Vec::new());
        spec.silf = SilfSpec {
            classes: vec![ClassSpec::Linear(vec![3]), ClassSpec::Linear(vec![1])],
            passes: vec![
                PassSpec {
                    rules: vec![ligature_rule()],
                    ..Default::default()
                },
                PassSpec {
                    rules: vec![second],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
        .build();
        assert_eq!(shape(&spec, "fi"), (vec![1], 1));
    }

    #[test]
    fn rule_loop_limit_terminates() {
        // An unconditional rule whose action stays at the origin would loop
        // forever without the limit
        let spec = ligature_font(vec![PassSpec {
            max_rule_loop: 3,
            rules: vec![RuleSpec {
                sort_key: 1,
                pre_context: 0,
                constraint: Vec::new(),
                action: vec![50], // ret_true without moving
            }],
            ..Default::default()
        }]);
        assert_eq!(shape(&spec, "fi"), (vec![1, 2], 2));
    }

    #[test]
    fn zero_pass_font_is_identity() {
        let spec = ligature_font(Vec::new());
        assert_eq!(shape(&spec, "fi"), (vec![1, 2], 2));
    }
}

//! Instantiation-based contraction for universally quantified
//! constraints.
//!
//! Any instantiation of a ∀-literal is implied by it, so contracting the
//! outer box with `body[q/y]` for sampled points `q` of the quantified
//! domain is sound. The samples are fixed at construction (domain
//! midpoint plus one endpoint variation per quantified variable), each
//! instantiation becoming an ordinary forward/backward contractor.

use std::fmt;

use d5_core::formula::FormulaNode;
use d5_core::{Expression, ExpressionSubstitution, Formula, FormulaSubstitution, SymbolicResult};
use d5_interval::{BitSet, IntervalBox};

use crate::config::Config;
use crate::fwdbwd::FwdBwdContractor;
use crate::status::ContractorStatus;

/// Contractor for one `Forall(vars, body)` literal.
pub struct ForallContractor {
    formula: Formula,
    instantiated: Vec<FwdBwdContractor>,
    input: BitSet,
}

impl ForallContractor {
    /// Build instantiation contractors for `f` over the outer box.
    /// `quantified_domains` supplies the domain of every quantified
    /// variable; quantified variables without a domain keep only the
    /// midpoint of nothing, i.e. are not sampled.
    pub fn new(
        f: Formula,
        quantified_domains: &IntervalBox,
        outer: &IntervalBox,
        config: &Config,
    ) -> SymbolicResult<ForallContractor> {
        let mut input = BitSet::new(outer.size());
        for v in f.free_variables().iter() {
            if let Some(i) = outer.index_of(v) {
                input.add(i);
            }
        }

        let mut instantiated = Vec::new();
        if let FormulaNode::Forall(vars, body) = f.node() {
            let sampled: Vec<_> = vars
                .iter()
                .filter(|v| quantified_domains.interval_of(v).is_some())
                .cloned()
                .collect();

            // Midpoint sample, then one endpoint variation per variable.
            let mut samples: Vec<ExpressionSubstitution> = Vec::new();
            let mut base = ExpressionSubstitution::default();
            for v in &sampled {
                let iv = quantified_domains.interval_of(v).unwrap();
                base.insert(v.clone(), Expression::constant(iv.mid()));
            }
            samples.push(base.clone());
            for v in &sampled {
                let iv = *quantified_domains.interval_of(v).unwrap();
                for endpoint in [iv.lb, iv.ub] {
                    if endpoint.is_finite() && endpoint != iv.mid() {
                        let mut s = base.clone();
                        s.insert(v.clone(), Expression::constant(endpoint));
                        samples.push(s);
                    }
                }
            }

            let formula_subst = FormulaSubstitution::default();
            for s in &samples {
                let inst = body.substitute(s, &formula_subst)?;
                // A partial sample leaves quantified variables free; such
                // an instantiation cannot be enforced on the outer box.
                if !inst.free_variables().is_disjoint(vars) {
                    continue;
                }
                let ctc = FwdBwdContractor::new(inst, outer, config);
                if !ctc.is_dummy() {
                    instantiated.push(ctc);
                }
            }
        }

        Ok(ForallContractor {
            formula: f,
            instantiated,
            input,
        })
    }

    /// The quantified constraint.
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Dimensions this contractor may narrow.
    pub fn input(&self) -> &BitSet {
        &self.input
    }

    /// True iff no instantiation can prune.
    pub fn is_dummy(&self) -> bool {
        self.instantiated.is_empty()
    }

    /// Contract with every instantiation. The used-constraint record
    /// names the original quantified formula, not the instantiations.
    pub fn prune(&self, cs: &mut ContractorStatus) {
        if self.instantiated.is_empty() || cs.current().is_empty() {
            return;
        }
        let mut inner = ContractorStatus::new(cs.current().clone(), cs.worker_id());
        for c in &self.instantiated {
            c.prune(&mut inner);
            if inner.current().is_empty() {
                break;
            }
        }
        if !inner.used_constraints().is_empty() {
            cs.add_used_constraint(self.formula.clone());
        }
        cs.output_mut().union_with(inner.output());
        *cs.current_mut() = inner.current().clone();
    }
}

impl fmt::Debug for ForallContractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForallContractor")
            .field("formula", &self.formula.to_string())
            .field("instantiations", &self.instantiated.len())
            .finish()
    }
}

impl fmt::Display for ForallContractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Forall({})", self.formula)
    }
}

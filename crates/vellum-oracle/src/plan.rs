use vellum_authority::NarrateOptions;
use vellum_types::EventId;

/// Where narrated events come from, in the order they are consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NarrationSource {
    /// Events handed in through [`NarrateOptions::event_log`].
    EventLog,
    /// The local partition log.
    LocalLog,
    /// The remote authority connection.
    Authority,
}

/// The event id range still to be narrated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NarrationRange {
    pub first_event_id: Option<EventId>,
    /// Inclusive.
    pub last_event_id: Option<EventId>,
}

impl NarrationRange {
    /// The part of the range after `narrated_last`.
    pub fn after(&self, narrated_last: Option<EventId>) -> Self {
        match narrated_last {
            Some(last) => Self {
                first_event_id: Some(self.first_event_id.map_or(last + 1, |first| first.max(last + 1))),
                last_event_id: self.last_event_id,
            },
            None => *self,
        }
    }

    /// Apply the range to a copy of `opts`.
    pub fn apply(&self, opts: &NarrateOptions) -> NarrateOptions {
        let mut opts = opts.clone();
        opts.first_event_id = self.first_event_id;
        opts.last_event_id = self.last_event_id;
        opts
    }
}

/// Ordered narration sources with the rule that ends the narration early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NarrationPlan {
    sources: Vec<NarrationSource>,
    range: NarrationRange,
}

impl NarrationPlan {
    /// Plan a narration: the explicit event log when one is given, then the
    /// local log, then the authority unless remote narration is suppressed
    /// or no remote may exist.
    pub fn build(opts: &NarrateOptions, remote_possible: bool) -> Self {
        let mut sources = Vec::with_capacity(3);
        if opts.event_log.as_ref().is_some_and(|events| !events.is_empty()) {
            sources.push(NarrationSource::EventLog);
        }
        sources.push(NarrationSource::LocalLog);
        if remote_possible && !opts.dont_remote_narrate {
            sources.push(NarrationSource::Authority);
        }
        Self {
            sources,
            range: NarrationRange {
                first_event_id: opts.first_event_id,
                last_event_id: opts.last_event_id,
            },
        }
    }

    pub fn sources(&self) -> &[NarrationSource] {
        &self.sources
    }

    pub fn range(&self) -> NarrationRange {
        self.range
    }

    pub fn includes(&self, source: NarrationSource) -> bool {
        self.sources.contains(&source)
    }

    /// A source ends the narration when it yielded something and the
    /// requested range is covered: either no last event id was requested or
    /// the narration reached it.
    pub fn should_stop(&self, yielded: usize, narrated_last: Option<EventId>) -> bool {
        if yielded == 0 {
            return false;
        }
        match self.range.last_event_id {
            None => true,
            Some(wanted) => narrated_last.is_some_and(|last| last >= wanted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_types::{Action, CommandId, Event, PartitionUri};

    fn event_log(count: u64) -> Vec<Event> {
        let partition = PartitionUri::parse("vellum-local:///p").unwrap();
        (0..count)
            .map(|eid| Event::for_partition(&partition, eid, CommandId::new(), Action::Frozen { id: "x".into() }))
            .collect()
    }

    #[test]
    fn sources_are_ordered() {
        let opts = NarrateOptions::default().with_event_log(event_log(2));
        let plan = NarrationPlan::build(&opts, true);
        assert_eq!(
            plan.sources(),
            &[NarrationSource::EventLog, NarrationSource::LocalLog, NarrationSource::Authority]
        );

        let plan = NarrationPlan::build(&NarrateOptions::default(), false);
        assert_eq!(plan.sources(), &[NarrationSource::LocalLog]);

        let mut opts = NarrateOptions::default();
        opts.dont_remote_narrate = true;
        assert!(!NarrationPlan::build(&opts, true).includes(NarrationSource::Authority));
    }

    #[test]
    fn empty_sources_never_stop() {
        let plan = NarrationPlan::build(&NarrateOptions::default(), true);
        assert!(!plan.should_stop(0, None));
        assert!(plan.should_stop(1, Some(0)));
    }

    #[test]
    fn requested_last_event_id_must_be_reached() {
        let opts = NarrateOptions::default().with_range(None, Some(9));
        let plan = NarrationPlan::build(&opts, true);
        assert!(!plan.should_stop(5, Some(4)));
        assert!(plan.should_stop(10, Some(9)));
        assert!(plan.should_stop(1, Some(12)));
    }

    #[test]
    fn remainder_starts_after_narrated_events() {
        let range = NarrationRange {
            first_event_id: Some(2),
            last_event_id: Some(9),
        };
        assert_eq!(range.after(None), range);
        assert_eq!(range.after(Some(4)).first_event_id, Some(5));
        assert_eq!(range.after(Some(0)).first_event_id, Some(2));
        assert_eq!(NarrationRange::default().after(Some(3)).first_event_id, Some(4));
    }
}

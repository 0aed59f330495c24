use crate::models::{AttendanceRecord, AttendanceStatus, Role};

/// Predicates for narrowing a record list. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub search: Option<String>,
    pub program: Option<String>,
    pub sub_group: Option<String>,
    pub role: Option<Role>,
    pub status: Option<AttendanceStatus>,
}

/// Treats empty strings and the literal `all` as "no filter".
pub fn parse_scope(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
        .map(str::to_string)
}

impl AttendanceFilter {
    pub fn new(
        search: Option<&str>,
        program: Option<&str>,
        sub_group: Option<&str>,
        role: Option<Role>,
        status: Option<AttendanceStatus>,
    ) -> Self {
        Self {
            search: parse_scope(search),
            program: parse_scope(program),
            sub_group: parse_scope(sub_group),
            role,
            status,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.search.is_none()
            && self.program.is_none()
            && self.sub_group.is_none()
            && self.role.is_none()
            && self.status.is_none()
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            if !record.name.to_lowercase().contains(&needle)
                && !record.email.to_lowercase().contains(&needle)
            {
                return false;
            }
        }

        if let Some(program) = &self.program {
            if !record.program.eq_ignore_ascii_case(program) {
                return false;
            }
        }

        if let Some(sub_group) = &self.sub_group {
            if !record.sub_group.eq_ignore_ascii_case(sub_group) {
                return false;
            }
        }

        if self.role.is_some_and(|role| role != record.role) {
            return false;
        }

        !self.status.is_some_and(|status| status != record.status)
    }

    /// Matching records in their original order.
    pub fn apply<'a>(&self, records: &'a [AttendanceRecord]) -> Vec<&'a AttendanceRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::sample_record;

    fn roster() -> Vec<AttendanceRecord> {
        let mut john = sample_record("John Doe", Role::Student, 8, 10);
        john.email = "john.doe@x.com".to_string();
        let mut jane = sample_record("Jane Roe", Role::Facilitator, 10, 10);
        jane.sub_group = "Cohort B".to_string();
        jane.status = AttendanceStatus::Late;
        let mut kiara = sample_record("Kiara Patel", Role::Student, 3, 10);
        kiara.program = "Product Design".to_string();
        kiara.status = AttendanceStatus::Absent;
        vec![john, jane, kiara]
    }

    #[test]
    fn empty_filter_returns_everything_in_order() {
        let records = roster();
        let filter = AttendanceFilter::new(Some("all"), Some("all"), Some(""), None, None);
        assert!(filter.is_empty());

        let names: Vec<&str> = filter
            .apply(&records)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["John Doe", "Jane Roe", "Kiara Patel"]);
    }

    #[test]
    fn search_is_case_insensitive_on_name_and_email() {
        let mut records = roster();
        records[1].name = "Someone Else".to_string();
        records[1].email = "JOHN.backup@x.com".to_string();

        let filter = AttendanceFilter::new(Some("john"), None, None, None, None);
        let matched = filter.apply(&records);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].name, "John Doe");
        assert_eq!(matched[1].email, "JOHN.backup@x.com");
    }

    #[test]
    fn search_without_hits_is_empty_not_error() {
        let records = roster();
        let filter = AttendanceFilter::new(Some("zzz"), None, None, None, None);
        assert!(filter.apply(&records).is_empty());
    }

    #[test]
    fn enum_and_scope_predicates_combine() {
        let records = roster();

        let students = AttendanceFilter::new(None, None, None, Some(Role::Student), None);
        assert_eq!(students.apply(&records).len(), 2);

        let design_absent = AttendanceFilter::new(
            None,
            Some("product design"),
            None,
            Some(Role::Student),
            Some(AttendanceStatus::Absent),
        );
        let matched = design_absent.apply(&records);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "Kiara Patel");

        let cohort_b = AttendanceFilter::new(None, None, Some("Cohort B"), None, None);
        assert_eq!(cohort_b.apply(&records)[0].name, "Jane Roe");
    }
}

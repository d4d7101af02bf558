use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Declares a closed code set with a stable wire string per variant.
macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $code:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub enum $name {
            $(
                #[serde(rename = $code)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

code_enum! {
    /// Which system of record performed a write.
    pub enum InformationSource {
        Legacy => "LEGACY",
        Primary => "PRIMARY",
    }
}

code_enum! {
    pub enum ReportStatus {
        Draft => "DRAFT",
        AwaitingReview => "AWAITING_REVIEW",
        OnHold => "ON_HOLD",
        NeedsUpdating => "NEEDS_UPDATING",
        Updated => "UPDATED",
        Closed => "CLOSED",
        PostIncidentUpdate => "POST_INCIDENT_UPDATE",
        IncidentUpdated => "INCIDENT_UPDATED",
        Duplicate => "DUPLICATE",
        NotReportable => "NOT_REPORTABLE",
    }
}

code_enum! {
    /// Classification of an incident. Determines which questions apply.
    pub enum ReportType {
        Abscond => "ABSCOND",
        Assault => "ASSAULT",
        AttemptedEscapeFromCustody => "ATTEMPTED_ESCAPE_FROM_CUSTODY",
        AttemptedEscapeFromEscort => "ATTEMPTED_ESCAPE_FROM_ESCORT",
        BombThreat => "BOMB_THREAT",
        BreachOfSecurity => "BREACH_OF_SECURITY",
        Damage => "DAMAGE",
        DeathInCustody => "DEATH_IN_CUSTODY",
        DeathOther => "DEATH_OTHER",
        Disorder => "DISORDER",
        DroneSighting => "DRONE_SIGHTING",
        EscapeFromCustody => "ESCAPE_FROM_CUSTODY",
        EscapeFromEscort => "ESCAPE_FROM_ESCORT",
        Find => "FIND",
        Fire => "FIRE",
        FoodRefusal => "FOOD_REFUSAL",
        FullCloseDownSearch => "FULL_CLOSE_DOWN_SEARCH",
        KeyOrLock => "KEY_OR_LOCK",
        Miscellaneous => "MISCELLANEOUS",
        RadioCompromise => "RADIO_COMPROMISE",
        ReleasedInError => "RELEASED_IN_ERROR",
        SelfHarm => "SELF_HARM",
        TemporaryReleaseFailure => "TEMPORARY_RELEASE_FAILURE",
        ToolLoss => "TOOL_LOSS",
    }
}

code_enum! {
    pub enum StaffRole {
        ActivelyInvolved => "ACTIVELY_INVOLVED",
        AuthorisingOfficer => "AUTHORISING_OFFICER",
        CrHead => "CR_HEAD",
        CrLeftArm => "CR_LEFT_ARM",
        CrLegs => "CR_LEGS",
        CrRightArm => "CR_RIGHT_ARM",
        CrSupervisor => "CR_SUPERVISOR",
        Deceased => "DECEASED",
        FirstOnScene => "FIRST_ON_SCENE",
        Healthcare => "HEALTHCARE",
        Hostage => "HOSTAGE",
        InPossession => "IN_POSSESSION",
        Negotiator => "NEGOTIATOR",
        PresentAtScene => "PRESENT_AT_SCENE",
        SuspectedInvolvement => "SUSPECTED_INVOLVEMENT",
        Victim => "VICTIM",
        Witness => "WITNESS",
    }
}

code_enum! {
    pub enum PrisonerRole {
        Absconder => "ABSCONDER",
        ActiveInvolvement => "ACTIVE_INVOLVEMENT",
        Assailant => "ASSAILANT",
        AssistedStaff => "ASSISTED_STAFF",
        Deceased => "DECEASED",
        Escapee => "ESCAPE",
        Fighter => "FIGHTER",
        Hostage => "HOSTAGE",
        ImpededStaff => "IMPEDED_STAFF",
        InPossession => "IN_POSSESSION",
        IntendedRecipient => "INTENDED_RECIPIENT",
        LicenseFailure => "LICENSE_FAILURE",
        Perpetrator => "PERPETRATOR",
        PresentAtScene => "PRESENT_AT_SCENE",
        SuspectedAssailant => "SUSPECTED_ASSAILANT",
        SuspectedInvolved => "SUSPECTED_INVOLVED",
        TemporaryReleaseFailure => "TEMPORARY_RELEASE_FAILURE",
        Victim => "VICTIM",
    }
}

code_enum! {
    pub enum PrisonerOutcome {
        Acct => "ACCT",
        ChargedByPolice => "CHARGED_BY_POLICE",
        Convicted => "CONVICTED",
        CoronerInformed => "CORONER_INFORMED",
        Death => "DEATH",
        FurtherCharges => "FURTHER_CHARGES",
        LocalInvestigation => "LOCAL_INVESTIGATION",
        NextOfKinInformed => "NEXT_OF_KIN_INFORMED",
        PlacedOnReport => "PLACED_ON_REPORT",
        PoliceInvestigation => "POLICE_INVESTIGATION",
        Remand => "REMAND",
        SeenDutyGovernor => "SEEN_DUTY_GOV",
        SeenHealthcare => "SEEN_HEALTHCARE",
        SeenImb => "SEEN_IMB",
        SeenOutsideHospital => "SEEN_OUTSIDE_HOSP",
        Transfer => "TRANSFER",
        Trial => "TRIAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_parses_back_to_its_variant() {
        for report_type in ReportType::ALL {
            assert_eq!(ReportType::parse(report_type.as_str()), Some(*report_type));
        }
        for status in ReportStatus::ALL {
            assert_eq!(ReportStatus::parse(status.as_str()), Some(*status));
        }
        for role in PrisonerRole::ALL {
            assert_eq!(PrisonerRole::parse(role.as_str()), Some(*role));
        }
        assert_eq!(InformationSource::parse("legacy"), None);
    }

    #[test]
    fn serde_uses_the_wire_code() -> Result<(), serde_json::Error> {
        let encoded = serde_json::to_string(&PrisonerRole::Escapee)?;
        assert_eq!(encoded, "\"ESCAPE\"");
        let decoded: StaffRole = serde_json::from_str("\"CR_HEAD\"")?;
        assert_eq!(decoded, StaffRole::CrHead);
        Ok(())
    }
}

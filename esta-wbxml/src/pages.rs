//! ActiveSync code pages.
//!
//! Token numbering follows MS-ASWBXML, with two fixed points: Ping lives on
//! page 14 and AirSyncBase on page 17 (Provision moves to 13 to keep 14
//! unambiguous). A single table drives both the encoder and the decoder, so
//! the two halves can never disagree about a token value.

pub const AIRSYNC: u8 = 0;
pub const CONTACTS: u8 = 1;
pub const EMAIL: u8 = 2;
pub const CALENDAR: u8 = 4;
pub const MOVE: u8 = 5;
pub const ESTIMATE: u8 = 6;
pub const FOLDERS: u8 = 7;
pub const PROVISION: u8 = 13;
pub const PING: u8 = 14;
pub const SEARCH: u8 = 15;
pub const AIRSYNCBASE: u8 = 17;
pub const SETTINGS: u8 = 18;
pub const ITEMOPS: u8 = 20;
pub const COMPOSE: u8 = 21;

pub struct Page {
    pub id: u8,
    pub name: &'static str,
    tokens: &'static [(u8, &'static str)],
}

const AIRSYNC_TOKENS: &[(u8, &str)] = &[
    (0x05, "Sync"),
    (0x06, "Responses"),
    (0x07, "Add"),
    (0x08, "Change"),
    (0x09, "Delete"),
    (0x0A, "Fetch"),
    (0x0B, "SyncKey"),
    (0x0C, "ClientId"),
    (0x0D, "ServerId"),
    (0x0E, "Status"),
    (0x0F, "Collection"),
    (0x10, "Class"),
    (0x11, "Version"),
    (0x12, "CollectionId"),
    (0x13, "GetChanges"),
    (0x14, "MoreAvailable"),
    (0x15, "WindowSize"),
    (0x16, "Commands"),
    (0x17, "Options"),
    (0x18, "FilterType"),
    (0x19, "Truncation"),
    (0x1A, "RtfTruncation"),
    (0x1B, "Conflict"),
    (0x1C, "Collections"),
    (0x1D, "ApplicationData"),
    (0x1E, "DeletesAsMoves"),
    (0x1F, "NotifyGUID"),
    (0x20, "Supported"),
    (0x21, "SoftDelete"),
    (0x22, "MIMESupport"),
    (0x23, "MIMETruncation"),
    (0x24, "Wait"),
    (0x25, "Limit"),
    (0x26, "Partial"),
    (0x27, "ConversationMode"),
    (0x28, "MaxItems"),
    (0x29, "HeartbeatInterval"),
];

const CONTACTS_TOKENS: &[(u8, &str)] = &[
    (0x05, "Anniversary"),
    (0x06, "AssistantName"),
    (0x07, "AssistantTelephoneNumber"),
    (0x08, "Birthday"),
    (0x0C, "Business2TelephoneNumber"),
    (0x0D, "BusinessAddressCity"),
    (0x0E, "BusinessAddressCountry"),
    (0x0F, "BusinessAddressPostalCode"),
    (0x10, "BusinessAddressState"),
    (0x11, "BusinessAddressStreet"),
    (0x12, "BusinessFaxNumber"),
    (0x13, "BusinessTelephoneNumber"),
    (0x14, "CarTelephoneNumber"),
    (0x15, "Categories"),
    (0x16, "Category"),
    (0x17, "Children"),
    (0x18, "Child"),
    (0x19, "CompanyName"),
    (0x1A, "Department"),
    (0x1B, "Email1Address"),
    (0x1C, "Email2Address"),
    (0x1D, "Email3Address"),
    (0x1E, "FileAs"),
    (0x1F, "FirstName"),
    (0x20, "HomeTelephoneNumber"),
    (0x21, "Home2TelephoneNumber"),
    (0x22, "HomeAddressCity"),
    (0x23, "HomeAddressCountry"),
    (0x24, "HomeAddressPostalCode"),
    (0x25, "HomeAddressState"),
    (0x26, "HomeAddressStreet"),
    (0x27, "HomeFaxNumber"),
    (0x28, "JobTitle"),
    (0x29, "LastName"),
    (0x2A, "MiddleName"),
    (0x2B, "MobileTelephoneNumber"),
    (0x2C, "OfficeLocation"),
    (0x35, "PagerNumber"),
    (0x36, "RadioTelephoneNumber"),
    (0x37, "Spouse"),
    (0x38, "Suffix"),
    (0x39, "Title"),
    (0x3A, "WebPage"),
];

const EMAIL_TOKENS: &[(u8, &str)] = &[
    (0x05, "Attachment"),
    (0x06, "Attachments"),
    (0x07, "AttName"),
    (0x08, "AttSize"),
    (0x09, "Att0Id"),
    (0x0A, "AttMethod"),
    (0x0B, "AttRemoved"),
    (0x0C, "Body"),
    (0x0D, "BodySize"),
    (0x0E, "BodyTruncated"),
    (0x0F, "DateReceived"),
    (0x10, "DisplayName"),
    (0x11, "DisplayTo"),
    (0x12, "Importance"),
    (0x13, "MessageClass"),
    (0x14, "Subject"),
    (0x15, "Read"),
    (0x16, "To"),
    (0x17, "Cc"),
    (0x18, "From"),
    (0x19, "ReplyTo"),
    (0x1A, "AllDayEvent"),
    (0x1B, "Categories"),
    (0x1C, "Category"),
    (0x1D, "DtStamp"),
    (0x1E, "EndTime"),
    (0x1F, "InstanceType"),
    (0x20, "BusyStatus"),
    (0x21, "Location"),
    (0x22, "MeetingRequest"),
    (0x23, "Organizer"),
    (0x24, "RecurrenceId"),
    (0x25, "Reminder"),
    (0x26, "ResponseRequested"),
    (0x27, "Recurrences"),
    (0x28, "Recurrence"),
    (0x29, "RecurrenceType"),
    (0x2A, "Until"),
    (0x2B, "Occurrences"),
    (0x2C, "Interval"),
    (0x2D, "DayOfWeek"),
    (0x2E, "DayOfMonth"),
    (0x2F, "WeekOfMonth"),
    (0x30, "MonthOfYear"),
    (0x31, "StartTime"),
    (0x32, "Sensitivity"),
    (0x33, "TimeZone"),
    (0x34, "GlobalObjId"),
    (0x35, "ThreadTopic"),
    (0x36, "MIMEData"),
    (0x37, "MIMETruncated"),
    (0x38, "MIMESize"),
    (0x39, "InternetCPID"),
    (0x3A, "Flag"),
    (0x3B, "FlagStatus"),
    (0x3C, "ContentClass"),
    (0x3D, "FlagType"),
    (0x3E, "CompleteTime"),
    (0x3F, "DisallowNewTimeProposal"),
];

const CALENDAR_TOKENS: &[(u8, &str)] = &[
    (0x05, "TimeZone"),
    (0x06, "AllDayEvent"),
    (0x07, "Attendees"),
    (0x08, "Attendee"),
    (0x09, "AttendeeEmail"),
    (0x0A, "AttendeeName"),
    (0x0D, "BusyStatus"),
    (0x0E, "Categories"),
    (0x0F, "Category"),
    (0x10, "DtStamp"),
    (0x11, "EndTime"),
    (0x12, "Exception"),
    (0x13, "Exceptions"),
    (0x14, "ExceptionDeleted"),
    (0x15, "ExceptionStartTime"),
    (0x16, "Location"),
    (0x17, "MeetingStatus"),
    (0x18, "OrganizerEmail"),
    (0x19, "OrganizerName"),
    (0x1A, "Recurrence"),
    (0x1B, "RecurrenceType"),
    (0x1C, "Until"),
    (0x1D, "Occurrences"),
    (0x1E, "Interval"),
    (0x1F, "DayOfWeek"),
    (0x20, "DayOfMonth"),
    (0x21, "WeekOfMonth"),
    (0x22, "MonthOfYear"),
    (0x23, "Reminder"),
    (0x24, "Sensitivity"),
    (0x25, "Subject"),
    (0x26, "StartTime"),
    (0x27, "UID"),
];

const MOVE_TOKENS: &[(u8, &str)] = &[
    (0x05, "MoveItems"),
    (0x06, "Move"),
    (0x07, "SrcMsgId"),
    (0x08, "SrcFldId"),
    (0x09, "DstFldId"),
    (0x0A, "Response"),
    (0x0B, "Status"),
    (0x0C, "DstMsgId"),
];

const ESTIMATE_TOKENS: &[(u8, &str)] = &[
    (0x05, "GetItemEstimate"),
    (0x06, "Version"),
    (0x07, "Collections"),
    (0x08, "Collection"),
    (0x09, "Class"),
    (0x0A, "CollectionId"),
    (0x0B, "DateTime"),
    (0x0C, "Estimate"),
    (0x0D, "Status"),
];

const FOLDERS_TOKENS: &[(u8, &str)] = &[
    (0x05, "Folders"),
    (0x06, "Folder"),
    (0x07, "DisplayName"),
    (0x08, "ServerId"),
    (0x09, "ParentId"),
    (0x0A, "Type"),
    (0x0B, "Response"),
    (0x0C, "Status"),
    (0x0D, "ContentClass"),
    (0x0E, "Changes"),
    (0x0F, "Add"),
    (0x10, "Delete"),
    (0x11, "Update"),
    (0x12, "SyncKey"),
    (0x13, "FolderCreate"),
    (0x14, "FolderDelete"),
    (0x15, "FolderUpdate"),
    (0x16, "FolderSync"),
    (0x17, "Count"),
];

const PROVISION_TOKENS: &[(u8, &str)] = &[
    (0x05, "Provision"),
    (0x06, "Policies"),
    (0x07, "Policy"),
    (0x08, "PolicyType"),
    (0x09, "PolicyKey"),
    (0x0A, "Data"),
    (0x0B, "Status"),
    (0x0C, "RemoteWipe"),
    (0x0D, "EASProvisionDoc"),
    (0x0E, "DevicePasswordEnabled"),
    (0x0F, "AlphanumericDevicePasswordRequired"),
    (0x10, "RequireStorageCardEncryption"),
    (0x11, "PasswordRecoveryEnabled"),
    (0x13, "AttachmentsEnabled"),
    (0x14, "MinDevicePasswordLength"),
    (0x15, "MaxInactivityTimeDeviceLock"),
    (0x16, "MaxDevicePasswordFailedAttempts"),
    (0x17, "MaxAttachmentSize"),
    (0x18, "AllowSimpleDevicePassword"),
    (0x19, "DevicePasswordExpiration"),
    (0x1A, "DevicePasswordHistory"),
    (0x1B, "AllowStorageCard"),
    (0x1C, "AllowCamera"),
    (0x1D, "RequireDeviceEncryption"),
    (0x1E, "AllowUnsignedApplications"),
    (0x1F, "AllowUnsignedInstallationPackages"),
    (0x20, "MinDevicePasswordComplexCharacters"),
    (0x21, "AllowWiFi"),
    (0x22, "AllowTextMessaging"),
    (0x23, "AllowPOPIMAPEmail"),
    (0x24, "AllowBluetooth"),
    (0x25, "AllowIrDA"),
    (0x26, "RequireManualSyncWhenRoaming"),
    (0x27, "AllowDesktopSync"),
    (0x28, "MaxCalendarAgeFilter"),
    (0x29, "AllowHTMLEmail"),
    (0x2A, "MaxEmailAgeFilter"),
    (0x2B, "MaxEmailBodyTruncationSize"),
    (0x2C, "MaxEmailHTMLBodyTruncationSize"),
    (0x2D, "RequireSignedSMIMEMessages"),
    (0x2E, "RequireEncryptedSMIMEMessages"),
    (0x2F, "RequireSignedSMIMEAlgorithm"),
    (0x30, "RequireEncryptionSMIMEAlgorithm"),
    (0x31, "AllowSMIMEEncryptionAlgorithmNegotiation"),
    (0x32, "AllowSMIMESoftCerts"),
    (0x33, "AllowBrowser"),
    (0x34, "AllowConsumerEmail"),
    (0x35, "AllowRemoteDesktop"),
    (0x36, "AllowInternetSharing"),
];

const PING_TOKENS: &[(u8, &str)] = &[
    (0x05, "Ping"),
    (0x06, "AutdState"),
    (0x07, "Status"),
    (0x08, "HeartbeatInterval"),
    (0x09, "Folders"),
    (0x0A, "Folder"),
    (0x0B, "Id"),
    (0x0C, "Class"),
    (0x0D, "MaxFolders"),
];

const SEARCH_TOKENS: &[(u8, &str)] = &[
    (0x05, "Search"),
    (0x07, "Store"),
    (0x08, "Name"),
    (0x09, "Query"),
    (0x0A, "Options"),
    (0x0B, "Range"),
    (0x0C, "Status"),
    (0x0D, "Response"),
    (0x0E, "Result"),
    (0x0F, "Properties"),
    (0x10, "Total"),
    (0x11, "EqualTo"),
    (0x12, "Value"),
    (0x13, "And"),
    (0x14, "Or"),
    (0x15, "FreeText"),
    (0x17, "DeepTraversal"),
    (0x18, "LongId"),
    (0x19, "RebuildResults"),
];

const AIRSYNCBASE_TOKENS: &[(u8, &str)] = &[
    (0x05, "BodyPreference"),
    (0x06, "Type"),
    (0x07, "TruncationSize"),
    (0x08, "AllOrNone"),
    (0x0A, "Body"),
    (0x0B, "Data"),
    (0x0C, "EstimatedDataSize"),
    (0x0D, "Truncated"),
    (0x0E, "Attachments"),
    (0x0F, "Attachment"),
    (0x10, "DisplayName"),
    (0x11, "FileReference"),
    (0x12, "Method"),
    (0x13, "ContentId"),
    (0x14, "ContentLocation"),
    (0x15, "IsInline"),
    (0x16, "NativeBodyType"),
    (0x17, "ContentType"),
    (0x18, "Preview"),
    (0x19, "BodyPartPreference"),
    (0x1A, "BodyPart"),
    (0x1B, "Status"),
];

const SETTINGS_TOKENS: &[(u8, &str)] = &[
    (0x05, "Settings"),
    (0x06, "Status"),
    (0x07, "Get"),
    (0x08, "Set"),
    (0x09, "Oof"),
    (0x0A, "OofState"),
    (0x0B, "StartTime"),
    (0x0C, "EndTime"),
    (0x0D, "OofMessage"),
    (0x0E, "AppliesToInternal"),
    (0x0F, "AppliesToExternalKnown"),
    (0x10, "AppliesToExternalUnknown"),
    (0x11, "Enabled"),
    (0x12, "ReplyMessage"),
    (0x13, "BodyType"),
    (0x14, "DevicePassword"),
    (0x15, "Password"),
    (0x16, "DeviceInformation"),
    (0x17, "Model"),
    (0x18, "IMEI"),
    (0x19, "FriendlyName"),
    (0x1A, "OS"),
    (0x1B, "OSLanguage"),
    (0x1C, "PhoneNumber"),
    (0x1D, "UserInformation"),
    (0x1E, "EmailAddresses"),
    (0x1F, "SMTPAddress"),
    (0x20, "UserAgent"),
    (0x21, "EnableOutboundSMS"),
    (0x22, "MobileOperator"),
    (0x23, "PrimarySmtpAddress"),
    (0x24, "Accounts"),
    (0x25, "Account"),
    (0x26, "AccountId"),
    (0x27, "AccountName"),
    (0x28, "UserDisplayName"),
    (0x29, "SendDisabled"),
];

const ITEMOPS_TOKENS: &[(u8, &str)] = &[
    (0x05, "ItemOperations"),
    (0x06, "Fetch"),
    (0x07, "Store"),
    (0x08, "Options"),
    (0x09, "Range"),
    (0x0A, "Total"),
    (0x0B, "Properties"),
    (0x0C, "Data"),
    (0x0D, "Status"),
    (0x0E, "Response"),
    (0x0F, "Version"),
    (0x10, "Schema"),
    (0x11, "Part"),
    (0x12, "EmptyFolderContents"),
    (0x13, "DeleteSubFolders"),
    (0x14, "UserName"),
    (0x15, "Password"),
    (0x16, "Move"),
    (0x17, "DstFldId"),
    (0x18, "ConversationId"),
    (0x19, "MoveAlways"),
];

const COMPOSE_TOKENS: &[(u8, &str)] = &[
    (0x05, "SendMail"),
    (0x06, "SmartForward"),
    (0x07, "SmartReply"),
    (0x08, "SaveInSentItems"),
    (0x09, "ReplaceMime"),
    (0x0B, "Source"),
    (0x0C, "FolderId"),
    (0x0D, "ItemId"),
    (0x0E, "LongId"),
    (0x0F, "InstanceId"),
    (0x10, "Mime"),
    (0x11, "ClientId"),
    (0x12, "Status"),
    (0x13, "AccountId"),
];

pub const PAGES: &[Page] = &[
    Page { id: AIRSYNC, name: "AirSync", tokens: AIRSYNC_TOKENS },
    Page { id: CONTACTS, name: "Contacts", tokens: CONTACTS_TOKENS },
    Page { id: EMAIL, name: "Email", tokens: EMAIL_TOKENS },
    Page { id: CALENDAR, name: "Calendar", tokens: CALENDAR_TOKENS },
    Page { id: MOVE, name: "Move", tokens: MOVE_TOKENS },
    Page { id: ESTIMATE, name: "GetItemEstimate", tokens: ESTIMATE_TOKENS },
    Page { id: FOLDERS, name: "FolderHierarchy", tokens: FOLDERS_TOKENS },
    Page { id: PROVISION, name: "Provision", tokens: PROVISION_TOKENS },
    Page { id: PING, name: "Ping", tokens: PING_TOKENS },
    Page { id: SEARCH, name: "Search", tokens: SEARCH_TOKENS },
    Page { id: AIRSYNCBASE, name: "AirSyncBase", tokens: AIRSYNCBASE_TOKENS },
    Page { id: SETTINGS, name: "Settings", tokens: SETTINGS_TOKENS },
    Page { id: ITEMOPS, name: "ItemOperations", tokens: ITEMOPS_TOKENS },
    Page { id: COMPOSE, name: "ComposeMail", tokens: COMPOSE_TOKENS },
];

pub fn page(id: u8) -> Option<&'static Page> {
    PAGES.iter().find(|p| p.id == id)
}

/// Resolve a base token (content/attribute bits already stripped) to its
/// element name. `None` means "defined page, unknown token": the decoder
/// skips the element instead of failing, per the forward-compatibility rule.
pub fn tag_of(page_id: u8, token: u8) -> Option<&'static str> {
    page(page_id)?
        .tokens
        .iter()
        .find(|(t, _)| *t == token)
        .map(|(_, n)| *n)
}

pub fn token_of(page_id: u8, tag: &str) -> Option<u8> {
    page(page_id)?
        .tokens
        .iter()
        .find(|(_, n)| *n == tag)
        .map(|(t, _)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_consistent() {
        for p in PAGES {
            for (token, name) in p.tokens {
                assert!((0x05..=0x3F).contains(token), "{} 0x{:02x}", name, token);
                assert_eq!(tag_of(p.id, *token), Some(*name));
                assert_eq!(token_of(p.id, name), Some(*token));
            }
        }
    }

    #[test]
    fn no_duplicate_tokens_within_a_page() {
        for p in PAGES {
            for (i, (token, _)) in p.tokens.iter().enumerate() {
                assert!(
                    !p.tokens[i + 1..].iter().any(|(t, _)| t == token),
                    "duplicate token 0x{:02x} on page {}",
                    token,
                    p.name
                );
            }
        }
    }

    #[test]
    fn ping_and_airsyncbase_page_assignments() {
        assert_eq!(page(14).unwrap().name, "Ping");
        assert_eq!(page(17).unwrap().name, "AirSyncBase");
    }
}
